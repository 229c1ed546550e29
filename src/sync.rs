//! Polling synchronization loop.
//!
//! One fetch per interval drives eventual consistency for everyone who
//! has the workspace open:
//!
//! ```text
//! every 3s ── fetch ──► unstamped? drop tick
//!                  │
//!                  ├─ our own write echoing back ──► skip
//!                  ├─ stamp already observed ──────► skip
//!                  │
//!                  ├─ merge presence (always)
//!                  ├─ adopt files + title (only when clean)
//!                  │     └─ reconcile slots, refresh preview
//!                  └─ record observed stamp
//! ```
//!
//! Conflicts resolve document-wide last-writer-wins at save time; a dirty
//! working copy shields local edits from adoption until they commit, and
//! the commit then overwrites whatever was remote. Fetch failures are
//! logged and the loop keeps going.
//!
//! Reference: Kleppmann, Chapter 5 — Replication (last write wins)

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::document::WorkspaceDocument;
use crate::preview::PreviewController;
use crate::schedule::{spawn_repeating, TaskHandle};
use crate::session::{emit, SessionEvent, SharedSession};
use crate::store::{with_retry, DocumentStore, RetryPolicy, StoreError};

/// Everything one tick needs. Cheap to clone into the loop task.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) session: SharedSession,
    pub(crate) events: mpsc::Sender<SessionEvent>,
    pub(crate) preview: PreviewController,
    pub(crate) email: String,
    pub(crate) retry: RetryPolicy,
}

pub(crate) fn spawn_sync_loop(ctx: SyncContext, interval: Duration) -> TaskHandle {
    spawn_repeating(interval, move || {
        let ctx = ctx.clone();
        async move {
            if let Err(err) = run_tick(&ctx).await {
                log::warn!("sync tick failed: {err}");
            }
        }
    })
}

/// One poll of the store, applied to the session.
pub(crate) async fn run_tick(ctx: &SyncContext) -> Result<(), StoreError> {
    let id = { ctx.session.read().await.workspace_id().clone() };
    let raw = with_retry(&ctx.retry, || {
        let store = ctx.store.clone();
        let id = id.clone();
        async move { store.get(&id).await }
    })
    .await?;
    let doc = WorkspaceDocument::decode(&id, raw);

    // Healthy writes always carry a stamp; an unstamped document is
    // either brand new or corrupt, and neither should clobber state.
    let Some(stamp) = doc.updated_at else {
        log::warn!("workspace {id}: unstamped remote document, tick skipped");
        return Ok(());
    };

    let (presence_changed, adopted) = {
        let mut session = ctx.session.write().await;
        if doc.last_modified_by.as_deref() == Some(ctx.email.as_str())
            && session.last_written_updated_at() == Some(stamp)
        {
            return Ok(());
        }
        if session.last_observed_updated_at() == Some(stamp) {
            return Ok(());
        }

        let presence_changed = session.merge_presence(doc.presence.clone());
        let mut adopted = false;
        if session.differs_from(&doc) {
            if session.is_dirty() {
                log::debug!("workspace {id}: local edits pending, remote content not adopted");
            } else {
                session.adopt_remote(&doc);
                adopted = true;
            }
        }
        session.record_observed(Some(stamp));
        (presence_changed, adopted)
    };

    if presence_changed {
        emit(&ctx.events, SessionEvent::PresenceChanged);
    }
    if adopted {
        log::info!(
            "workspace {id}: adopted remote update by {}",
            doc.last_modified_by.as_deref().unwrap_or("unknown")
        );
        emit(&ctx.events, SessionEvent::RemoteUpdate);
        ctx.preview.request_refresh().await;
    }
    Ok(())
}

// ===================================================================
// Tests
// ===================================================================
