//! Deferred persistence: the autosave arm and the commit path.
//!
//! Every document mutation reports here. The first one arms a delayed
//! commit; mutations inside the window ride along without extending it,
//! so a continuously typing user still saves once per window. Explicit
//! saves cancel the arm and commit immediately; clean sessions never
//! write at all.
//!
//! A commit patches only `title`, `files` and `lastModifiedBy`. Presence
//! lives in its own patches and is carried through untouched by the
//! store's shallow merge. The session's `dirty` flag clears only when no
//! edit landed while the commit was in flight.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::document::{DocumentPatch, WorkspaceDocument};
use crate::schedule::Debounce;
use crate::session::{emit, SessionError, SessionEvent, SharedSession};
use crate::store::{with_retry, DocumentStore, RetryPolicy, StoreError};

/// Owns the autosave timer and the commit path. Cheap to clone; clones
/// share one timer.
#[derive(Clone)]
pub(crate) struct AutosaveScheduler {
    inner: Arc<AutosaveInner>,
}

struct AutosaveInner {
    store: Arc<dyn DocumentStore>,
    session: SharedSession,
    email: String,
    events: mpsc::Sender<SessionEvent>,
    timer: Debounce,
    delay: Duration,
    retry: RetryPolicy,
    read_only: bool,
}

impl AutosaveScheduler {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        session: SharedSession,
        email: String,
        events: mpsc::Sender<SessionEvent>,
        delay: Duration,
        retry: RetryPolicy,
        read_only: bool,
    ) -> Self {
        AutosaveScheduler {
            inner: Arc::new(AutosaveInner {
                store,
                session,
                email,
                events,
                timer: Debounce::new(),
                delay,
                retry,
                read_only,
            }),
        }
    }

    /// Reports a document mutation. Arms the delayed commit when no arm
    /// is pending; an armed timer is never extended.
    pub(crate) async fn note_mutation(&self) {
        if self.inner.read_only {
            return;
        }
        let this = self.clone();
        let armed = self
            .inner
            .timer
            .schedule_if_idle(self.inner.delay, move || async move {
                this.autosave_fire().await;
            })
            .await;
        if armed {
            log::debug!("autosave armed ({:?})", self.inner.delay);
        }
    }

    async fn autosave_fire(&self) {
        // An explicit save may have cleaned the session meanwhile.
        if !self.inner.session.read().await.is_dirty() {
            log::debug!("autosave fired on clean session, skipping");
            return;
        }
        if let Err(err) = self.commit().await {
            log::warn!("autosave failed: {err}");
            emit(
                &self.inner.events,
                SessionEvent::SaveFailed {
                    message: err.to_string(),
                },
            );
        }
    }

    /// Explicit save: cancels the pending arm and commits now. A clean
    /// session skips the write and reports success.
    pub(crate) async fn save_now(&self) -> Result<(), SessionError> {
        if self.inner.read_only {
            return Err(SessionError::ReadOnly);
        }
        self.inner.timer.cancel().await;
        if !self.inner.session.read().await.is_dirty() {
            log::debug!("save requested on clean session, skipping write");
            return Ok(());
        }
        match self.commit().await {
            Ok(()) => Ok(()),
            Err(err) => {
                emit(
                    &self.inner.events,
                    SessionEvent::SaveFailed {
                        message: err.to_string(),
                    },
                );
                Err(SessionError::Store(err))
            }
        }
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let (id, title, files, revision) = {
            let session = self.inner.session.read().await;
            let (title, files, revision) = session.commit_snapshot();
            (session.workspace_id().clone(), title, files, revision)
        };
        let patch = DocumentPatch::content(title, files, self.inner.email.clone())
            .into_value()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let written = with_retry(&self.inner.retry, || {
            let store = self.inner.store.clone();
            let id = id.clone();
            let patch = patch.clone();
            async move { store.update(&id, patch).await }
        })
        .await?;

        let stamp = WorkspaceDocument::decode(&id, written).updated_at;
        self.inner
            .session
            .write()
            .await
            .mark_saved(revision, stamp, Utc::now());
        log::info!("workspace {id} saved");
        emit(&self.inner.events, SessionEvent::Saved);
        Ok(())
    }

    pub(crate) async fn has_pending(&self) -> bool {
        self.inner.timer.is_pending().await
    }

    pub(crate) async fn dispose(&self) {
        self.inner.timer.dispose().await
    }
}

// ===================================================================
// Tests
// ===================================================================
