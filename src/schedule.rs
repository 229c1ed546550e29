//! Owned, cancellable timers.
//!
//! Every periodic or deferred behavior in the engine (sync polling,
//! autosave arming, cursor and preview debouncing) runs on one of the two
//! primitives here, so disposal semantics live in exactly one place.
//!
//! The contract: after `cancel`/`dispose` returns, a sleeping callback
//! will not start. A callback already executing checks the shared liveness
//! flag before touching engine state. Dropping a handle cancels it, which
//! makes timer ownership follow normal Rust ownership.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ───────────────────────────────────────────────────────────────────
// Repeating tasks
// ───────────────────────────────────────────────────────────────────

/// Handle to a spawned repeating task. Cancelling (or dropping) stops
/// future runs; the liveness flag is shared with the task so a tick that
/// already woke re-checks it before running.
#[derive(Debug)]
pub struct TaskHandle {
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.task.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Spawns a fixed-interval task. The first run lands one full period after
/// spawn; missed ticks are delayed, not bunched.
pub fn spawn_repeating<F, Fut>(period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let alive = Arc::new(AtomicBool::new(true));
    let flag = alive.clone();
    let task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // tokio intervals fire immediately; swallow that tick
        timer.tick().await;
        loop {
            timer.tick().await;
            if !flag.load(Ordering::SeqCst) {
                break;
            }
            tick().await;
        }
    });
    TaskHandle { alive, task }
}

// ───────────────────────────────────────────────────────────────────
// Debounce
// ───────────────────────────────────────────────────────────────────

/// Re-armable one-shot timer.
///
/// `schedule` replaces any pending arm (trailing-edge debounce: only the
/// last caller in a burst runs). `schedule_if_idle` arms only when nothing
/// is pending and never extends an existing arm, which is the autosave
/// contract. `dispose` is terminal: later arms are ignored.
#[derive(Debug)]
pub struct Debounce {
    alive: Arc<AtomicBool>,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for Debounce {
    fn default() -> Self {
        Debounce::new()
    }
}

impl Debounce {
    pub fn new() -> Self {
        Debounce {
            alive: Arc::new(AtomicBool::new(true)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Arms the timer, replacing any pending arm.
    pub async fn schedule<F, Fut>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if !self.alive.load(Ordering::SeqCst) {
            log::debug!("debounce disposed, dropping arm request");
            return;
        }
        let mut slot = self.pending.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(self.spawn_arm(delay, callback));
    }

    /// Arms the timer only when no arm is pending. Returns whether a new
    /// arm was created.
    pub async fn schedule_if_idle<F, Fut>(&self, delay: Duration, callback: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let mut slot = self.pending.lock().await;
        let idle = match &*slot {
            Some(task) => task.is_finished(),
            None => true,
        };
        if !idle {
            return false;
        }
        *slot = Some(self.spawn_arm(delay, callback));
        true
    }

    fn spawn_arm<F, Fut>(&self, delay: Duration, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let alive = self.alive.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !alive.load(Ordering::SeqCst) {
                return;
            }
            // Clear the slot before running so the callback itself (or
            // anything it triggers) can arm the next cycle.
            pending.lock().await.take();
            callback().await;
        })
    }

    /// Drops the pending arm, if any. The timer stays usable.
    pub async fn cancel(&self) {
        if let Some(task) = self.pending.lock().await.take() {
            task.abort();
        }
    }

    pub async fn is_pending(&self) -> bool {
        match &*self.pending.lock().await {
            Some(task) => !task.is_finished(),
            None => false,
        }
    }

    /// Cancels the pending arm and permanently disables the timer.
    pub async fn dispose(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.cancel().await;
    }
}

// ===================================================================
// Tests
// ===================================================================
