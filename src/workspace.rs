//! One open collaborative workspace: wiring, operations, close flow.
//!
//! [`WorkspaceSession`] assembles the whole engine around a shared
//! [`EditSession`] and owns every timer it runs:
//!
//! ```text
//!   store ◀─── poll ─────  sync loop          fixed 3s tick
//!   store ◀─── publish ──  cursor debounce    trailing 200ms
//!   store ◀─── commit ───  autosave arm       one-shot 30s
//!   frame ◀─── render ───  preview debounce   trailing 300ms
//! ```
//!
//! All four are disposed by [`WorkspaceSession::close`]; no callback runs
//! after close returns. Closing a dirty session hands back a
//! [`PendingClose`] so the caller must choose between saving and
//! discarding. There is no silent-loss path.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::autosave::AutosaveScheduler;
use crate::document::{
    starter_files, CursorPosition, FileEntry, Language, LanguageFamily, WorkspaceDocument,
    WorkspaceId,
};
use crate::editor::{EditorAdapter, EditorBus, EditorWidget};
use crate::presence::{cursors_for_file, roster, PresenceBroadcaster, PresenceRoster, RemoteCursor};
use crate::preview::{PreviewController, RenderSurface, SandboxPolicy};
use crate::schedule::TaskHandle;
use crate::session::{EditSession, SessionError, SessionEvent, SharedSession};
use crate::store::{with_retry, DocumentStore, RetryPolicy, StoreError, UploadService};
use crate::sync::{spawn_sync_loop, SyncContext};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Timer periods and policies for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Poll period of the sync loop.
    pub sync_interval: Duration,
    /// Quiet period before an armed autosave commits.
    pub autosave_delay: Duration,
    /// Trailing debounce for cursor publishes.
    pub cursor_debounce: Duration,
    /// Trailing debounce for preview recompiles.
    pub preview_debounce: Duration,
    pub retry: RetryPolicy,
    /// Read-only sessions never poll, publish, arm or commit.
    pub read_only: bool,
    pub sandbox: SandboxPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            sync_interval: Duration::from_secs(3),
            autosave_delay: Duration::from_secs(30),
            cursor_debounce: Duration::from_millis(200),
            preview_debounce: Duration::from_millis(300),
            retry: RetryPolicy::default(),
            read_only: false,
            sandbox: SandboxPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Short timers for wall-clock tests.
    pub fn for_testing() -> Self {
        SessionConfig {
            sync_interval: Duration::from_millis(50),
            autosave_delay: Duration::from_millis(200),
            cursor_debounce: Duration::from_millis(20),
            preview_debounce: Duration::from_millis(30),
            retry: RetryPolicy::for_testing(),
            read_only: false,
            sandbox: SandboxPolicy::default(),
        }
    }
}

/// The local collaborator, keyed by email everywhere presence appears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub email: String,
}

impl ClientIdentity {
    pub fn new(email: impl Into<String>) -> Self {
        ClientIdentity { email: email.into() }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session facade
// ───────────────────────────────────────────────────────────────────

/// An open workspace. One value per workspace per client.
pub struct WorkspaceSession {
    id: WorkspaceId,
    email: String,
    session: SharedSession,
    events: Option<mpsc::Receiver<SessionEvent>>,
    broadcaster: PresenceBroadcaster,
    preview: PreviewController,
    autosave: AutosaveScheduler,
    sync_task: Option<TaskHandle>,
    bus: EditorBus,
    read_only: bool,
}

impl WorkspaceSession {
    /// Creates a new workspace document seeded with the starter file set
    /// and returns its id.
    pub async fn create(
        store: Arc<dyn DocumentStore>,
        title: &str,
        identity: &ClientIdentity,
        retry: &RetryPolicy,
    ) -> Result<WorkspaceId, SessionError> {
        let files = serde_json::to_value(starter_files())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let doc = serde_json::json!({
            "title": title,
            "files": files,
            "presence": [],
            "lastModifiedBy": identity.email,
        });
        let created = with_retry(retry, || {
            let store = store.clone();
            let doc = doc.clone();
            async move { store.create(doc).await }
        })
        .await?;
        let id = created
            .get("id")
            .and_then(Value::as_str)
            .map(WorkspaceId::from)
            .ok_or_else(|| {
                StoreError::Serialization("created document carries no id".to_owned())
            })?;
        log::info!("created workspace {id} ({title})");
        Ok(id)
    }

    /// Opens an existing workspace and starts its timers.
    ///
    /// A document that decodes to zero files is seeded locally with the
    /// starter set and left dirty, so the next commit repairs the remote
    /// copy. Read-only sessions skip seeding and never start the sync
    /// loop.
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        id: WorkspaceId,
        identity: ClientIdentity,
        surface: Arc<dyn RenderSurface>,
        config: SessionConfig,
    ) -> Result<WorkspaceSession, SessionError> {
        let raw = with_retry(&config.retry, || {
            let store = store.clone();
            let id = id.clone();
            async move { store.get(&id).await }
        })
        .await?;
        let doc = WorkspaceDocument::decode(&id, raw);
        let seed = doc.files.is_empty() && !config.read_only;
        let session: SharedSession =
            Arc::new(RwLock::new(EditSession::from_document(doc, config.read_only)));

        if seed {
            log::info!("workspace {id} has no files, seeding starter set");
            let mut guard = session.write().await;
            let mut first_markup = None;
            for file in starter_files() {
                let markup = file.family() == Some(LanguageFamily::Markup);
                let added = guard.add_file(file)?;
                if markup && first_markup.is_none() {
                    first_markup = Some(added);
                }
            }
            if let Some(markup) = first_markup {
                guard.open_editor(markup, 0)?;
            }
        }

        let (tx, rx) = mpsc::channel(256);
        let broadcaster = PresenceBroadcaster::new(
            store.clone(),
            session.clone(),
            identity.email.clone(),
            tx.clone(),
            config.cursor_debounce,
            config.read_only,
        );
        let preview = PreviewController::new(
            session.clone(),
            surface,
            tx.clone(),
            config.preview_debounce,
            config.sandbox.clone(),
        );
        let autosave = AutosaveScheduler::new(
            store.clone(),
            session.clone(),
            identity.email.clone(),
            tx.clone(),
            config.autosave_delay,
            config.retry.clone(),
            config.read_only,
        );
        let sync_task = if config.read_only {
            None
        } else {
            let ctx = SyncContext {
                store: store.clone(),
                session: session.clone(),
                events: tx,
                preview: preview.clone(),
                email: identity.email.clone(),
                retry: config.retry.clone(),
            };
            Some(spawn_sync_loop(ctx, config.sync_interval))
        };

        let workspace = WorkspaceSession {
            id,
            email: identity.email,
            session,
            events: Some(rx),
            broadcaster,
            preview,
            autosave,
            sync_task,
            bus: EditorBus::new(),
            read_only: config.read_only,
        };

        workspace.broadcaster.announce_active_file().await;
        if seed {
            workspace.autosave.note_mutation().await;
        }
        workspace.preview.refresh_now().await;
        log::info!("workspace {} open (read_only: {})", workspace.id, workspace.read_only);
        Ok(workspace)
    }

    // ── Document operations ──────────────────────────────────────────

    /// Replaces the content of a code file. Arms autosave and refreshes
    /// the preview when the content actually changed.
    pub async fn edit_file(&self, id: Uuid, code: String) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let changed = {
            let mut session = self.session.write().await;
            let before = session.revision();
            session.edit_file(id, code)?;
            session.revision() != before
        };
        if changed {
            self.note_document_change().await;
        }
        Ok(())
    }

    /// Adds a code file pre-filled with the language's template.
    pub async fn add_code_file(
        &self,
        name: &str,
        language: Language,
    ) -> Result<Uuid, SessionError> {
        self.ensure_writable()?;
        let entry = FileEntry::code(name, language, &language.template(name));
        let id = self.session.write().await.add_file(entry)?;
        self.note_document_change().await;
        Ok(id)
    }

    /// Adds an asset entry that already has a resolved locator.
    pub async fn add_asset(&self, name: &str, url: &str, size: u64) -> Result<Uuid, SessionError> {
        self.ensure_writable()?;
        let mut entry = FileEntry::asset(name, url);
        entry.size = size;
        let id = self.session.write().await.add_file(entry)?;
        self.note_document_change().await;
        Ok(id)
    }

    /// Uploads a blob and adds the resulting asset entry.
    pub async fn upload_asset(
        &self,
        uploader: &dyn UploadService,
        name: &str,
        bytes: &[u8],
    ) -> Result<Uuid, SessionError> {
        self.ensure_writable()?;
        let url = uploader.upload(name, bytes).await?;
        self.add_asset(name, &url, bytes.len() as u64).await
    }

    /// Deletes a file. Open editor slots drop it and the preview root is
    /// promoted to the next markup file or cleared.
    pub async fn delete_file(&self, id: Uuid) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let removed = self.session.write().await.remove_file(id)?;
        log::info!("workspace {}: deleted {}", self.id, removed.name);
        self.note_document_change().await;
        Ok(())
    }

    pub async fn rename_file(&self, id: Uuid, new_name: &str) -> Result<(), SessionError> {
        self.ensure_writable()?;
        self.session
            .write()
            .await
            .rename_file(id, new_name.to_owned())?;
        // Renames can invalidate asset references and page links.
        self.note_document_change().await;
        Ok(())
    }

    pub async fn set_title(&self, title: &str) -> Result<(), SessionError> {
        self.ensure_writable()?;
        let changed = {
            let mut session = self.session.write().await;
            let before = session.revision();
            session.set_title(title.to_owned());
            session.revision() != before
        };
        if changed {
            self.autosave.note_mutation().await;
        }
        Ok(())
    }

    /// Commits outstanding edits immediately. Clean sessions skip the
    /// write.
    pub async fn save(&self) -> Result<(), SessionError> {
        self.autosave.save_now().await
    }

    // ── View operations ──────────────────────────────────────────────

    /// Binds a file to one of the two editor slots and announces the new
    /// active file immediately.
    pub async fn open_editor(&self, id: Uuid, slot: usize) -> Result<(), SessionError> {
        self.session.write().await.open_editor(id, slot)?;
        self.broadcaster.announce_active_file().await;
        Ok(())
    }

    pub async fn close_editor(&self, id: Uuid) {
        self.session.write().await.close_editor(id);
        self.broadcaster.announce_active_file().await;
    }

    /// Forwards a caret move into the debounced presence publish.
    pub async fn cursor_moved(&self, file_id: Uuid, line: u32, column: u32) {
        self.broadcaster
            .cursor_moved(CursorPosition { file_id, line, column })
            .await;
    }

    pub async fn set_preview_root(&self, id: Uuid) -> Result<(), SessionError> {
        self.session.write().await.set_preview_root(id)?;
        self.preview.request_refresh().await;
        Ok(())
    }

    /// Handles a message posted by the preview frame. The only accepted
    /// shape is the navigation request; anything else is ignored, as is a
    /// navigation to a page that does not exist.
    pub async fn handle_frame_message(&self, message: &Value) {
        let Some(crate::preview::FrameMessage::Navigate { page }) =
            crate::preview::parse_frame_message(message)
        else {
            return;
        };
        let target = {
            let session = self.session.read().await;
            session.file_by_name(&page).map(|f| f.id)
        };
        match target {
            Some(id) => {
                if let Err(err) = self.set_preview_root(id).await {
                    log::debug!("frame navigation to {page} rejected: {err}");
                }
            }
            None => log::debug!("frame navigation to unknown page {page} ignored"),
        }
    }

    /// Binds an editor widget to a file for the lifetime of a slot.
    pub fn bind_editor(&self, file_id: Uuid, widget: Arc<dyn EditorWidget>) -> EditorAdapter {
        EditorAdapter::new(
            file_id,
            widget,
            self.session.clone(),
            self.email.clone(),
            self.autosave.clone(),
            self.preview.clone(),
            self.broadcaster.clone(),
        )
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub async fn title(&self) -> String {
        self.session.read().await.title().to_owned()
    }

    pub async fn files(&self) -> Vec<FileEntry> {
        self.session.read().await.files().to_vec()
    }

    pub async fn is_dirty(&self) -> bool {
        self.session.read().await.is_dirty()
    }

    pub async fn preview_root(&self) -> Option<Uuid> {
        self.session.read().await.preview_root()
    }

    pub async fn open_editors(&self) -> Vec<Uuid> {
        self.session.read().await.open_editors().to_vec()
    }

    /// The collaborator roster: the local user (always online) plus
    /// live peers.
    pub async fn roster(&self) -> PresenceRoster {
        let session = self.session.read().await;
        roster(session.presence(), &self.email, chrono::Utc::now())
    }

    /// Live remote carets inside one file.
    pub async fn remote_cursors(&self, file_id: Uuid) -> Vec<RemoteCursor> {
        let session = self.session.read().await;
        cursors_for_file(session.presence(), &self.email, file_id, chrono::Utc::now())
    }

    /// The `sandbox` attribute value for the embedding frame.
    pub fn sandbox_attribute(&self) -> String {
        self.preview.sandbox().attribute()
    }

    pub fn editor_bus(&self) -> &EditorBus {
        &self.bus
    }

    /// Takes the session event stream. Yields `Some` exactly once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    // ── Close flow ───────────────────────────────────────────────────

    /// Stops every timer, then reports whether unsaved edits remain. No
    /// poll, publish, commit or render runs after this returns.
    pub async fn close(mut self) -> CloseOutcome {
        if let Some(task) = self.sync_task.take() {
            task.cancel();
        }
        self.broadcaster.dispose().await;
        self.preview.dispose().await;
        self.autosave.dispose().await;
        let dirty = !self.read_only && self.session.read().await.is_dirty();
        log::info!("workspace {} closed (dirty: {dirty})", self.id);
        if dirty {
            CloseOutcome::UnsavedChanges(PendingClose {
                autosave: self.autosave.clone(),
            })
        } else {
            CloseOutcome::Closed
        }
    }

    fn ensure_writable(&self) -> Result<(), SessionError> {
        if self.read_only {
            return Err(SessionError::ReadOnly);
        }
        Ok(())
    }

    async fn note_document_change(&self) {
        self.autosave.note_mutation().await;
        self.preview.request_refresh().await;
    }
}

/// Result of closing a session.
#[must_use]
pub enum CloseOutcome {
    /// Everything was saved; the session is gone.
    Closed,
    /// Unsaved edits remain. The caller must pick a branch.
    UnsavedChanges(PendingClose),
}

/// A closed session with unsaved edits. Consuming it is the only way
/// forward.
pub struct PendingClose {
    autosave: AutosaveScheduler,
}

impl PendingClose {
    /// Commits the outstanding edits, then finishes the close.
    pub async fn save_and_close(self) -> Result<(), SessionError> {
        self.autosave.save_now().await
    }

    /// Drops the outstanding edits.
    pub fn discard(self) {
        log::info!("unsaved edits discarded on close");
    }
}

// ===================================================================
// Tests
// ===================================================================
