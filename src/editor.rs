//! Bridge between an imperative editor widget and the reactive session.
//!
//! The widget side is a small object-safe trait: hosts implement
//! [`EditorWidget`] over whatever component they embed, and the adapter
//! drives it. Data flows both ways:
//!
//! ```text
//!   widget ──onChange──────▶ adapter ──▶ session files ──▶ autosave,
//!   widget ──onCursor──────▶ adapter ──▶ cursor broadcast     preview
//!   session ──adoption─────▶ adapter ──▶ widget.set_value (skip if equal)
//!   presence ──roster──────▶ adapter ──▶ widget.set_decorations
//! ```
//!
//! Content writes resolve files by id, never by name, so a rename racing
//! an edit cannot target the wrong entry. Incoming values equal to the
//! widget's buffer are dropped before `set_value`, otherwise every sync
//! tick would reset the caret.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::autosave::AutosaveScheduler;
use crate::document::{CursorPosition, Language};
use crate::presence::{cursors_for_file, PresenceBroadcaster, RemoteCursor};
use crate::preview::PreviewController;
use crate::session::{SessionError, SharedSession};

// ───────────────────────────────────────────────────────────────────
// Widget contract
// ───────────────────────────────────────────────────────────────────

/// Imperative surface of an embedded code editor.
pub trait EditorWidget: Send + Sync {
    /// Current buffer contents.
    fn value(&self) -> String;
    /// Replaces the buffer. Resets the caret, so callers skip it when the
    /// incoming value already matches.
    fn set_value(&self, text: &str);
    fn set_language(&self, language: Language);
    fn set_read_only(&self, read_only: bool);
    /// Replaces the whole decoration set. Never diffed incrementally.
    fn set_decorations(&self, decorations: &[CursorDecoration]);
    /// Invokes the widget's own formatter.
    fn format(&self);
}

/// A colored caret glyph for one remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorDecoration {
    pub email: String,
    /// CSS hex color, e.g. `#3fa28c`.
    pub color: String,
    pub line: u32,
    pub column: u32,
}

impl From<&RemoteCursor> for CursorDecoration {
    fn from(cursor: &RemoteCursor) -> Self {
        CursorDecoration {
            email: cursor.email.clone(),
            color: cursor.color.css(),
            line: cursor.line,
            column: cursor.column,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Command bus
// ───────────────────────────────────────────────────────────────────

/// Commands a host shell can address to whichever editor is listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorCommand {
    SaveRequested,
    FormatRequested,
}

/// Broadcast bus for editor commands. Subscribers that lag simply miss
/// commands; a command with no listeners is dropped.
#[derive(Clone)]
pub struct EditorBus {
    tx: broadcast::Sender<EditorCommand>,
}

impl EditorBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        EditorBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EditorCommand> {
        self.tx.subscribe()
    }

    pub fn request_save(&self) {
        self.publish(EditorCommand::SaveRequested);
    }

    pub fn request_format(&self) {
        self.publish(EditorCommand::FormatRequested);
    }

    fn publish(&self, command: EditorCommand) {
        if self.tx.send(command).is_err() {
            log::debug!("editor command {command:?} had no listeners");
        }
    }
}

impl Default for EditorBus {
    fn default() -> Self {
        EditorBus::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// Adapter
// ───────────────────────────────────────────────────────────────────

/// Binds one widget to one file id for the lifetime of an editor slot.
pub struct EditorAdapter {
    file_id: Uuid,
    widget: Arc<dyn EditorWidget>,
    session: SharedSession,
    email: String,
    autosave: AutosaveScheduler,
    preview: PreviewController,
    broadcaster: PresenceBroadcaster,
}

impl EditorAdapter {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file_id: Uuid,
        widget: Arc<dyn EditorWidget>,
        session: SharedSession,
        email: String,
        autosave: AutosaveScheduler,
        preview: PreviewController,
        broadcaster: PresenceBroadcaster,
    ) -> Self {
        EditorAdapter {
            file_id,
            widget,
            session,
            email,
            autosave,
            preview,
            broadcaster,
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    /// Pushes the bound file's content, language and read-only flag into
    /// the widget.
    pub async fn mount(&self) {
        let session = self.session.read().await;
        let Some(file) = session.file(self.file_id) else {
            log::debug!("editor bound to missing file {}", self.file_id);
            return;
        };
        let Some(code) = file.code_text() else {
            log::debug!("editor bound to asset {}, read-only", file.name);
            self.widget.set_read_only(true);
            return;
        };
        self.widget.set_value(code);
        if let Some(language) = file.language() {
            self.widget.set_language(language);
        }
        self.widget.set_read_only(session.is_read_only());
    }

    /// Widget content-change callback. Writes through to the session,
    /// arms autosave and requests a preview refresh when content actually
    /// changed.
    pub async fn handle_change(&self, text: String) -> Result<(), SessionError> {
        let changed = {
            let mut session = self.session.write().await;
            if session.is_read_only() {
                return Err(SessionError::ReadOnly);
            }
            let before = session.revision();
            session.edit_file(self.file_id, text)?;
            session.revision() != before
        };
        if changed {
            self.autosave.note_mutation().await;
            self.preview.request_refresh().await;
        }
        Ok(())
    }

    /// Widget caret callback. Forwards to the debounced broadcast.
    pub async fn handle_cursor(&self, line: u32, column: u32) {
        self.broadcaster
            .cursor_moved(CursorPosition {
                file_id: self.file_id,
                line,
                column,
            })
            .await;
    }

    /// Re-syncs the widget after the session changed underneath it, e.g.
    /// when a sync tick adopted remote content. Equal values are not
    /// re-set.
    pub async fn apply_props(&self) {
        let session = self.session.read().await;
        let Some(file) = session.file(self.file_id) else {
            return;
        };
        if let Some(code) = file.code_text() {
            if self.widget.value() != code {
                self.widget.set_value(code);
            }
        }
        if let Some(language) = file.language() {
            self.widget.set_language(language);
        }
        self.widget.set_read_only(session.is_read_only());
    }

    /// Recomputes the full remote-cursor decoration set for the bound
    /// file.
    pub async fn apply_remote_cursors(&self, now: DateTime<Utc>) {
        let decorations: Vec<CursorDecoration> = {
            let session = self.session.read().await;
            cursors_for_file(session.presence(), &self.email, self.file_id, now)
                .iter()
                .map(CursorDecoration::from)
                .collect()
        };
        self.widget.set_decorations(&decorations);
    }

    pub fn format(&self) {
        self.widget.format();
    }
}

// ───────────────────────────────────────────────────────────────────
// Recording widget
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct WidgetState {
    value: String,
    language: Option<Language>,
    read_only: bool,
    decorations: Vec<CursorDecoration>,
    set_value_calls: usize,
    format_calls: usize,
}

/// In-memory [`EditorWidget`] that records every call, for tests and
/// headless hosts.
#[derive(Default)]
pub struct RecordingEditor {
    state: std::sync::Mutex<WidgetState>,
}

impl RecordingEditor {
    pub fn new() -> Self {
        RecordingEditor::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WidgetState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn language(&self) -> Option<Language> {
        self.lock().language
    }

    pub fn read_only(&self) -> bool {
        self.lock().read_only
    }

    pub fn decorations(&self) -> Vec<CursorDecoration> {
        self.lock().decorations.clone()
    }

    /// How many times the buffer was replaced, caret resets included.
    pub fn set_value_calls(&self) -> usize {
        self.lock().set_value_calls
    }

    pub fn format_calls(&self) -> usize {
        self.lock().format_calls
    }
}

impl EditorWidget for RecordingEditor {
    fn value(&self) -> String {
        self.lock().value.clone()
    }

    fn set_value(&self, text: &str) {
        let mut state = self.lock();
        state.value = text.to_owned();
        state.set_value_calls += 1;
    }

    fn set_language(&self, language: Language) {
        self.lock().language = Some(language);
    }

    fn set_read_only(&self, read_only: bool) {
        self.lock().read_only = read_only;
    }

    fn set_decorations(&self, decorations: &[CursorDecoration]) {
        self.lock().decorations = decorations.to_vec();
    }

    fn format(&self) {
        self.lock().format_calls += 1;
    }
}

// ===================================================================
// Tests
// ===================================================================
