//! Client-side state for one open workspace.
//!
//! [`EditSession`] is the single mutable heart of the engine: the working
//! copy of the document, the editor slots, the preview root, and the
//! dirty/revision bookkeeping the sync and autosave layers hang off. It is
//! shared as `Arc<RwLock<EditSession>>` between the facade and the timer
//! tasks; every store call happens outside the lock.
//!
//! Two kinds of mutation are kept strictly apart:
//!
//! * document mutations (edit, add, remove, rename, retitle) bump the
//!   revision counter and set `dirty`, which the autosave layer commits;
//! * view mutations (slots, focus, preview root) touch neither, so moving
//!   panes around never causes a write.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::document::{FileEntry, LanguageFamily, PresenceEntry, WorkspaceDocument, WorkspaceId};
use crate::preview::default_preview_root;
use crate::store::StoreError;

/// Editor panes shown side by side. The surface renders at most two.
pub const MAX_OPEN_EDITORS: usize = 2;

pub(crate) type SharedSession = Arc<RwLock<EditSession>>;

// ───────────────────────────────────────────────────────────────────
// Events
// ───────────────────────────────────────────────────────────────────

/// Notifications for the embedding UI, delivered over the session's mpsc
/// channel. Emission is best-effort: a slow consumer loses events rather
/// than stalling a timer task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Newer remote content was adopted into the working copy.
    RemoteUpdate,
    /// The collaborator roster or a remote cursor changed.
    PresenceChanged,
    /// The preview recompiled against this root.
    PreviewRefreshed { root: Option<Uuid> },
    /// A commit reached the store.
    Saved,
    /// A commit failed after retries; the session stays dirty.
    SaveFailed { message: String },
}

pub(crate) fn emit(tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(err) = tx.try_send(event) {
        log::debug!("session event dropped: {err}");
    }
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    FileNotFound(Uuid),
    DuplicateName(String),
    /// The file exists but carries no editable source (an asset).
    NotEditable(String),
    /// The file cannot serve as a preview root (not markup).
    NotMarkup(String),
    SlotOutOfRange(usize),
    ReadOnly,
    Store(StoreError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::FileNotFound(id) => write!(f, "no file with id {id}"),
            SessionError::DuplicateName(name) => {
                write!(f, "a file named {name:?} already exists")
            }
            SessionError::NotEditable(name) => write!(f, "{name:?} is not an editable file"),
            SessionError::NotMarkup(name) => {
                write!(f, "{name:?} cannot serve as a preview root")
            }
            SessionError::SlotOutOfRange(slot) => {
                write!(f, "editor slot {slot} out of range (max {MAX_OPEN_EDITORS})")
            }
            SessionError::ReadOnly => f.write_str("session is read-only"),
            SessionError::Store(err) => write!(f, "store failure: {err}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        SessionError::Store(err)
    }
}

// ───────────────────────────────────────────────────────────────────
// Session state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct EditSession {
    workspace_id: WorkspaceId,
    title: String,
    files: Vec<FileEntry>,
    presence: Vec<PresenceEntry>,
    open_editors: Vec<Uuid>,
    focused: Option<Uuid>,
    preview_root: Option<Uuid>,
    dirty: bool,
    revision: u64,
    read_only: bool,
    last_saved_at: Option<DateTime<Utc>>,
    /// `updatedAt` produced by our own last write; ticks matching it (with
    /// our authorship) are echoes and get skipped wholesale.
    last_written_updated_at: Option<DateTime<Utc>>,
    /// `updatedAt` of the last remote version we processed.
    last_observed_updated_at: Option<DateTime<Utc>>,
}

impl EditSession {
    /// Builds session state around a decoded document. The first markup
    /// file (when present) starts open, focused, and previewed.
    pub fn from_document(doc: WorkspaceDocument, read_only: bool) -> Self {
        let preview_root = default_preview_root(&doc.files);
        let observed = doc.updated_at;
        EditSession {
            workspace_id: doc.id,
            title: doc.title,
            files: doc.files,
            presence: doc.presence,
            open_editors: preview_root.into_iter().collect(),
            focused: preview_root,
            preview_root,
            dirty: false,
            revision: 0,
            read_only,
            last_saved_at: None,
            last_written_updated_at: None,
            last_observed_updated_at: observed,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file(&self, id: Uuid) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn file_by_name(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn presence(&self) -> &[PresenceEntry] {
        &self.presence
    }

    pub fn open_editors(&self) -> &[Uuid] {
        &self.open_editors
    }

    pub fn focused(&self) -> Option<Uuid> {
        self.focused
    }

    pub fn preview_root(&self) -> Option<Uuid> {
        self.preview_root
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    pub(crate) fn last_written_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_written_updated_at
    }

    pub(crate) fn last_observed_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_observed_updated_at
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.dirty = true;
    }

    // ── Document mutations ───────────────────────────────────────

    /// Replaces a code file's source. Identical content is a no-op and
    /// does not dirty the session.
    pub fn edit_file(&mut self, id: Uuid, code: String) -> Result<(), SessionError> {
        let file = self
            .files
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(SessionError::FileNotFound(id))?;
        if !file.is_code() {
            return Err(SessionError::NotEditable(file.name.clone()));
        }
        if file.code_text() == Some(code.as_str()) {
            return Ok(());
        }
        file.set_code(code);
        self.touch();
        Ok(())
    }

    /// Adds a file with a workspace-unique name. The first markup file to
    /// arrive in a root-less workspace becomes the preview root.
    pub fn add_file(&mut self, entry: FileEntry) -> Result<Uuid, SessionError> {
        if self.files.iter().any(|f| f.name == entry.name) {
            return Err(SessionError::DuplicateName(entry.name));
        }
        let id = entry.id;
        let becomes_root =
            self.preview_root.is_none() && entry.family() == Some(LanguageFamily::Markup);
        self.files.push(entry);
        if becomes_root {
            self.preview_root = Some(id);
        }
        self.touch();
        Ok(id)
    }

    /// Removes a file, closing its editor slot and promoting the next
    /// markup file to preview root when the root itself went away.
    pub fn remove_file(&mut self, id: Uuid) -> Result<FileEntry, SessionError> {
        let idx = self
            .files
            .iter()
            .position(|f| f.id == id)
            .ok_or(SessionError::FileNotFound(id))?;
        let removed = self.files.remove(idx);
        self.reconcile_views();
        self.touch();
        Ok(removed)
    }

    pub fn rename_file(&mut self, id: Uuid, new_name: String) -> Result<(), SessionError> {
        if self.files.iter().any(|f| f.id != id && f.name == new_name) {
            return Err(SessionError::DuplicateName(new_name));
        }
        let file = self
            .files
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or(SessionError::FileNotFound(id))?;
        if file.name == new_name {
            return Ok(());
        }
        file.name = new_name;
        self.touch();
        Ok(())
    }

    pub fn set_title(&mut self, title: String) {
        if self.title != title {
            self.title = title;
            self.touch();
        }
    }

    // ── View mutations (never dirty the document) ────────────────

    /// Opens a file in one of the editor slots and focuses it. A file
    /// already open in some slot is focused in place.
    pub fn open_editor(&mut self, id: Uuid, slot: usize) -> Result<(), SessionError> {
        if slot >= MAX_OPEN_EDITORS {
            return Err(SessionError::SlotOutOfRange(slot));
        }
        if !self.files.iter().any(|f| f.id == id) {
            return Err(SessionError::FileNotFound(id));
        }
        if !self.open_editors.contains(&id) {
            if slot < self.open_editors.len() {
                self.open_editors[slot] = id;
            } else {
                self.open_editors.push(id);
            }
        }
        self.focused = Some(id);
        Ok(())
    }

    pub fn close_editor(&mut self, id: Uuid) {
        self.open_editors.retain(|open| *open != id);
        if self.focused == Some(id) {
            self.focused = self.open_editors.first().copied();
        }
    }

    pub fn set_preview_root(&mut self, id: Uuid) -> Result<(), SessionError> {
        let file = self.file(id).ok_or(SessionError::FileNotFound(id))?;
        if file.family() != Some(LanguageFamily::Markup) {
            return Err(SessionError::NotMarkup(file.name.clone()));
        }
        self.preview_root = Some(id);
        Ok(())
    }

    // ── Remote reconciliation ────────────────────────────────────

    /// Adopts remote content (files + title) into the working copy.
    /// Callers hold the dirty guard; this method does not re-check it.
    /// View state referring to vanished ids is reconciled.
    pub fn adopt_remote(&mut self, doc: &WorkspaceDocument) {
        self.title = doc.title.clone();
        self.files = doc.files.clone();
        self.reconcile_views();
    }

    /// True when the remote document carries content differing from the
    /// working copy (presence aside).
    pub fn differs_from(&self, doc: &WorkspaceDocument) -> bool {
        self.title != doc.title || self.files != doc.files
    }

    /// Replaces the presence roster; returns whether anything changed.
    pub fn merge_presence(&mut self, presence: Vec<PresenceEntry>) -> bool {
        if self.presence == presence {
            false
        } else {
            self.presence = presence;
            true
        }
    }

    fn reconcile_views(&mut self) {
        let ids: HashSet<Uuid> = self.files.iter().map(|f| f.id).collect();
        self.open_editors.retain(|id| ids.contains(id));
        if let Some(focused) = self.focused {
            if !ids.contains(&focused) {
                self.focused = self.open_editors.first().copied();
            }
        }
        match self.preview_root {
            Some(root) if ids.contains(&root) => {}
            _ => self.preview_root = default_preview_root(&self.files),
        }
    }

    // ── Persistence bookkeeping ──────────────────────────────────

    /// Snapshot for a commit: title, files, and the revision the snapshot
    /// was taken at.
    pub fn commit_snapshot(&self) -> (String, Vec<FileEntry>, u64) {
        (self.title.clone(), self.files.clone(), self.revision)
    }

    /// Records a durable commit. `dirty` clears only when no edit landed
    /// after the committed snapshot was taken.
    pub fn mark_saved(
        &mut self,
        snapshot_revision: u64,
        produced_stamp: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) {
        self.last_saved_at = Some(at);
        self.last_written_updated_at = produced_stamp;
        if self.revision == snapshot_revision {
            self.dirty = false;
        } else {
            log::debug!(
                "workspace {}: edits landed during commit, staying dirty",
                self.workspace_id
            );
        }
    }

    pub(crate) fn record_written(&mut self, stamp: Option<DateTime<Utc>>) {
        self.last_written_updated_at = stamp;
    }

    pub(crate) fn record_observed(&mut self, stamp: Option<DateTime<Utc>>) {
        self.last_observed_updated_at = stamp;
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Language, WorkspaceDocument};

    fn doc_with(files: Vec<FileEntry>) -> WorkspaceDocument {
        WorkspaceDocument {
            files,
            ..WorkspaceDocument::empty(WorkspaceId::from("ws_test"))
        }
    }

    fn three_file_session() -> (EditSession, Uuid, Uuid, Uuid) {
        let html = FileEntry::code("index.html", Language::Html, "<h1>hi</h1>");
        let css = FileEntry::code("styles.css", Language::Css, "body {}");
        let js = FileEntry::code("app.js", Language::JavaScript, "");
        let (h, c, j) = (html.id, css.id, js.id);
        let session = EditSession::from_document(doc_with(vec![html, css, js]), false);
        (session, h, c, j)
    }

    // ── Construction ─────────────────────────────────────────────

    #[test]
    fn test_first_markup_file_starts_open_and_previewed() {
        let (session, html, _, _) = three_file_session();
        assert_eq!(session.preview_root(), Some(html));
        assert_eq!(session.open_editors(), &[html]);
        assert_eq!(session.focused(), Some(html));
        assert!(!session.is_dirty());
    }

    #[test]
    fn test_session_without_markup_has_no_root() {
        let css = FileEntry::code("a.css", Language::Css, "");
        let session = EditSession::from_document(doc_with(vec![css]), false);
        assert_eq!(session.preview_root(), None);
        assert!(session.open_editors().is_empty());
    }

    // ── Document mutations ───────────────────────────────────────

    #[test]
    fn test_edit_marks_dirty_and_bumps_revision() {
        let (mut session, html, _, _) = three_file_session();
        session.edit_file(html, "<h1>new</h1>".into()).unwrap();
        assert!(session.is_dirty());
        assert_eq!(session.revision(), 1);
        assert_eq!(session.file(html).unwrap().code_text(), Some("<h1>new</h1>"));
        assert_eq!(session.file(html).unwrap().size, 12);
    }

    #[test]
    fn test_identical_edit_is_a_no_op() {
        let (mut session, html, _, _) = three_file_session();
        session.edit_file(html, "<h1>hi</h1>".into()).unwrap();
        assert!(!session.is_dirty());
        assert_eq!(session.revision(), 0);
    }

    #[test]
    fn test_editing_asset_is_rejected() {
        let asset = FileEntry::asset("logo.png", "mem://uploads/logo.png");
        let id = asset.id;
        let mut session = EditSession::from_document(doc_with(vec![asset]), false);
        let err = session.edit_file(id, "x".into()).unwrap_err();
        assert_eq!(err, SessionError::NotEditable("logo.png".into()));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut session, _, _, _) = three_file_session();
        let err = session
            .add_file(FileEntry::code("index.html", Language::Html, ""))
            .unwrap_err();
        assert_eq!(err, SessionError::DuplicateName("index.html".into()));
    }

    #[test]
    fn test_first_markup_added_becomes_root() {
        let css = FileEntry::code("a.css", Language::Css, "");
        let mut session = EditSession::from_document(doc_with(vec![css]), false);
        let about = session
            .add_file(FileEntry::code("about.html", Language::Html, ""))
            .unwrap();
        assert_eq!(session.preview_root(), Some(about));
    }

    #[test]
    fn test_added_markup_does_not_steal_existing_root() {
        let (mut session, html, _, _) = three_file_session();
        session
            .add_file(FileEntry::code("about.html", Language::Html, ""))
            .unwrap();
        assert_eq!(session.preview_root(), Some(html));
    }

    #[test]
    fn test_remove_open_file_closes_slot_and_refocuses() {
        let (mut session, html, css, _) = three_file_session();
        session.open_editor(css, 1).unwrap();
        session.remove_file(css).unwrap();
        assert_eq!(session.open_editors(), &[html]);
        assert_eq!(session.focused(), Some(html));
        assert!(session.is_dirty());
    }

    #[test]
    fn test_removing_root_promotes_next_markup() {
        let (mut session, html, _, _) = three_file_session();
        let about = session
            .add_file(FileEntry::code("about.html", Language::Html, ""))
            .unwrap();
        session.remove_file(html).unwrap();
        assert_eq!(session.preview_root(), Some(about));
    }

    #[test]
    fn test_removing_last_markup_clears_root() {
        let (mut session, html, _, _) = three_file_session();
        session.remove_file(html).unwrap();
        assert_eq!(session.preview_root(), None);
    }

    #[test]
    fn test_rename_rejects_collision_and_skips_no_op() {
        let (mut session, html, css, _) = three_file_session();
        assert_eq!(
            session.rename_file(css, "index.html".into()).unwrap_err(),
            SessionError::DuplicateName("index.html".into())
        );
        session.rename_file(html, "index.html".into()).unwrap();
        assert!(!session.is_dirty(), "renaming to the same name is a no-op");
        session.rename_file(html, "home.html".into()).unwrap();
        assert!(session.is_dirty());
    }

    // ── View mutations ───────────────────────────────────────────

    #[test]
    fn test_editor_slots_cap_at_two() {
        let (mut session, html, css, js) = three_file_session();
        session.open_editor(css, 1).unwrap();
        assert_eq!(session.open_editors(), &[html, css]);
        assert_eq!(
            session.open_editor(js, 2).unwrap_err(),
            SessionError::SlotOutOfRange(2)
        );
        session.open_editor(js, 0).unwrap();
        assert_eq!(session.open_editors(), &[js, css]);
        assert_eq!(session.focused(), Some(js));
    }

    #[test]
    fn test_opening_already_open_file_just_focuses() {
        let (mut session, html, css, _) = three_file_session();
        session.open_editor(css, 1).unwrap();
        session.open_editor(html, 1).unwrap();
        assert_eq!(session.open_editors(), &[html, css]);
        assert_eq!(session.focused(), Some(html));
    }

    #[test]
    fn test_view_changes_do_not_dirty() {
        let (mut session, _, css, _) = three_file_session();
        session.open_editor(css, 1).unwrap();
        session.close_editor(css);
        session.set_preview_root(session.preview_root().unwrap()).unwrap();
        assert!(!session.is_dirty());
        assert_eq!(session.revision(), 0);
    }

    #[test]
    fn test_preview_root_must_be_markup() {
        let (mut session, _, css, _) = three_file_session();
        assert_eq!(
            session.set_preview_root(css).unwrap_err(),
            SessionError::NotMarkup("styles.css".into())
        );
    }

    // ── Remote reconciliation ────────────────────────────────────

    #[test]
    fn test_adopt_remote_reconciles_vanished_ids() {
        let (mut session, _, css, _) = three_file_session();
        session.open_editor(css, 1).unwrap();

        // Remote deleted index.html and added contact.html.
        let contact = FileEntry::code("contact.html", Language::Html, "");
        let contact_id = contact.id;
        let css_entry = session.file(css).unwrap().clone();
        let remote = doc_with(vec![css_entry, contact]);

        session.adopt_remote(&remote);
        assert_eq!(session.open_editors(), &[css]);
        assert_eq!(session.focused(), Some(css));
        assert_eq!(session.preview_root(), Some(contact_id));
        assert!(!session.is_dirty(), "clean adoption stays clean");
    }

    #[test]
    fn test_differs_from_ignores_presence() {
        let (session, _, _, _) = three_file_session();
        let mut remote = doc_with(session.files().to_vec());
        remote.presence = vec![PresenceEntry::new("x@example.com", Utc::now())];
        assert!(!session.differs_from(&remote));
        remote.title = "changed".into();
        assert!(session.differs_from(&remote));
    }

    #[test]
    fn test_merge_presence_reports_change() {
        let (mut session, _, _, _) = three_file_session();
        let roster = vec![PresenceEntry::new("x@example.com", Utc::now())];
        assert!(session.merge_presence(roster.clone()));
        assert!(!session.merge_presence(roster));
    }

    // ── Persistence bookkeeping ──────────────────────────────────

    #[test]
    fn test_mark_saved_clears_dirty_at_matching_revision() {
        let (mut session, html, _, _) = three_file_session();
        session.edit_file(html, "<p>a</p>".into()).unwrap();
        let (_, _, revision) = session.commit_snapshot();
        let stamp = Utc::now();
        session.mark_saved(revision, Some(stamp), stamp);
        assert!(!session.is_dirty());
        assert_eq!(session.last_saved_at(), Some(stamp));
        assert_eq!(session.last_written_updated_at(), Some(stamp));
    }

    #[test]
    fn test_mark_saved_keeps_dirty_when_edits_raced() {
        let (mut session, html, css, _) = three_file_session();
        session.edit_file(html, "<p>a</p>".into()).unwrap();
        let (_, _, revision) = session.commit_snapshot();
        // An edit lands while the commit is in flight.
        session.edit_file(css, "body { margin: 0 }".into()).unwrap();
        session.mark_saved(revision, Some(Utc::now()), Utc::now());
        assert!(session.is_dirty(), "raced edit must keep the session dirty");
    }
}
