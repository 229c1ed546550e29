//! The render-target seam: sandbox policy, host/frame messaging, and the
//! debounced controller that feeds compiled documents to the surface.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::compile;
use crate::schedule::Debounce;
use crate::session::{emit, SessionEvent, SharedSession};

// ───────────────────────────────────────────────────────────────────
// Render surface
// ───────────────────────────────────────────────────────────────────

/// Host-side sink for compiled documents.
///
/// Implementations replace the frame's content wholesale on every render;
/// the engine never patches incrementally, so a surface needs no diffing
/// and no state beyond the current document.
pub trait RenderSurface: Send + Sync {
    fn replace_document(&self, html: &str);
}

/// Surface double that records every rendered document.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    documents: std::sync::Mutex<Vec<String>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        RecordingSurface::default()
    }

    pub fn documents(&self) -> Vec<String> {
        self.lock().clone()
    }

    pub fn last(&self) -> Option<String> {
        self.lock().last().cloned()
    }

    pub fn render_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.documents.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl RenderSurface for RecordingSurface {
    fn replace_document(&self, html: &str) {
        self.lock().push(html.to_owned());
    }
}

// ───────────────────────────────────────────────────────────────────
// Sandbox policy
// ───────────────────────────────────────────────────────────────────

/// Capabilities granted to the preview frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub allow_scripts: bool,
    pub allow_modals: bool,
    pub allow_forms: bool,
    pub allow_popups: bool,
    /// Off by default and meant to stay off: same-origin plus scripts
    /// would let preview content reach the host document.
    pub allow_same_origin: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        SandboxPolicy {
            allow_scripts: true,
            allow_modals: true,
            allow_forms: true,
            allow_popups: true,
            allow_same_origin: false,
        }
    }
}

impl SandboxPolicy {
    /// Value for the frame's `sandbox` attribute.
    pub fn attribute(&self) -> String {
        let mut grants = Vec::new();
        if self.allow_scripts {
            grants.push("allow-scripts");
        }
        if self.allow_modals {
            grants.push("allow-modals");
        }
        if self.allow_forms {
            grants.push("allow-forms");
        }
        if self.allow_popups {
            grants.push("allow-popups");
        }
        if self.allow_same_origin {
            grants.push("allow-same-origin");
        }
        grants.join(" ")
    }
}

// ───────────────────────────────────────────────────────────────────
// Frame messages
// ───────────────────────────────────────────────────────────────────

/// Requests the preview frame may post to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameMessage {
    /// The user clicked a rewritten page link.
    Navigate { page: String },
}

/// Strict parse of a frame's postMessage payload.
///
/// Only `{"type": "navigate", "page": <string>}` (extra fields tolerated)
/// yields a message; every other shape is silently ignored. Frame content
/// is untrusted and must not be able to produce host errors.
pub fn parse_frame_message(raw: &Value) -> Option<FrameMessage> {
    let obj = raw.as_object()?;
    if obj.get("type")?.as_str()? != "navigate" {
        return None;
    }
    let page = obj.get("page")?.as_str()?;
    Some(FrameMessage::Navigate {
        page: page.to_owned(),
    })
}

// ───────────────────────────────────────────────────────────────────
// Controller
// ───────────────────────────────────────────────────────────────────

/// Rendered while the workspace has no markup file to root the preview.
const PLACEHOLDER_HTML: &str = "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n</head>\n<body>\n<p style=\"font-family: system-ui, sans-serif; color: #777\">Add an HTML file to see a preview.</p>\n</body>\n</html>\n";

/// Debounced bridge between session state and the render surface.
///
/// Mutation bursts collapse into one recompile per window; a failed
/// compile leaves the last good render in place. Cheap to clone; clones
/// share one debounce.
#[derive(Clone)]
pub(crate) struct PreviewController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    session: SharedSession,
    surface: Arc<dyn RenderSurface>,
    events: mpsc::Sender<SessionEvent>,
    debounce: Debounce,
    window: Duration,
    sandbox: SandboxPolicy,
}

impl PreviewController {
    pub(crate) fn new(
        session: SharedSession,
        surface: Arc<dyn RenderSurface>,
        events: mpsc::Sender<SessionEvent>,
        window: Duration,
        sandbox: SandboxPolicy,
    ) -> Self {
        PreviewController {
            inner: Arc::new(ControllerInner {
                session,
                surface,
                events,
                debounce: Debounce::new(),
                window,
                sandbox,
            }),
        }
    }

    pub(crate) fn sandbox(&self) -> &SandboxPolicy {
        &self.inner.sandbox
    }

    /// Debounced recompile request.
    pub(crate) async fn request_refresh(&self) {
        let this = self.clone();
        self.inner
            .debounce
            .schedule(self.inner.window, move || async move {
                this.refresh_now().await;
            })
            .await;
    }

    /// Compiles and replaces the frame document right away.
    pub(crate) async fn refresh_now(&self) {
        let (files, root) = {
            let session = self.inner.session.read().await;
            (session.files().to_vec(), session.preview_root())
        };
        let Some(root_id) = root else {
            self.inner.surface.replace_document(PLACEHOLDER_HTML);
            emit(
                &self.inner.events,
                SessionEvent::PreviewRefreshed { root: None },
            );
            return;
        };
        match compile(&files, root_id) {
            Ok(compiled) => {
                self.inner.surface.replace_document(&compiled.html);
                emit(
                    &self.inner.events,
                    SessionEvent::PreviewRefreshed {
                        root: Some(root_id),
                    },
                );
            }
            Err(err) => {
                log::warn!("preview compile failed, keeping last render: {err}");
            }
        }
    }

    pub(crate) async fn dispose(&self) {
        self.inner.debounce.dispose().await;
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{FileEntry, Language, WorkspaceDocument, WorkspaceId};
    use crate::session::EditSession;
    use serde_json::json;
    use tokio::sync::RwLock;
    use tokio::time::sleep;

    // ── Sandbox tests ────────────────────────────────────────────

    #[test]
    fn test_default_sandbox_attribute() {
        assert_eq!(
            SandboxPolicy::default().attribute(),
            "allow-scripts allow-modals allow-forms allow-popups"
        );
    }

    #[test]
    fn test_same_origin_must_be_opted_into() {
        let policy = SandboxPolicy {
            allow_same_origin: true,
            ..SandboxPolicy::default()
        };
        assert!(policy.attribute().ends_with("allow-same-origin"));
        assert!(!SandboxPolicy::default().attribute().contains("same-origin"));
    }

    // ── Frame message tests ──────────────────────────────────────

    #[test]
    fn test_parse_accepts_well_formed_navigate() {
        let msg = parse_frame_message(&json!({ "type": "navigate", "page": "about.html" }));
        assert_eq!(
            msg,
            Some(FrameMessage::Navigate {
                page: "about.html".into()
            })
        );
    }

    #[test]
    fn test_parse_tolerates_extra_fields() {
        let msg = parse_frame_message(
            &json!({ "type": "navigate", "page": "a.html", "ts": 123, "junk": [1] }),
        );
        assert_eq!(msg, Some(FrameMessage::Navigate { page: "a.html".into() }));
    }

    #[test]
    fn test_parse_ignores_everything_else() {
        for raw in [
            json!({ "type": "scroll", "page": "a.html" }),
            json!({ "type": "navigate" }),
            json!({ "type": "navigate", "page": 7 }),
            json!({ "page": "a.html" }),
            json!("navigate"),
            json!(["navigate", "a.html"]),
            json!(null),
            json!(42),
        ] {
            assert_eq!(parse_frame_message(&raw), None, "accepted: {raw}");
        }
    }

    // ── Controller tests ─────────────────────────────────────────

    struct Rig {
        controller: PreviewController,
        surface: Arc<RecordingSurface>,
        _events: mpsc::Receiver<SessionEvent>,
    }

    fn rig_with(files: Vec<FileEntry>) -> Rig {
        let doc = WorkspaceDocument {
            files,
            ..WorkspaceDocument::empty(WorkspaceId::from("ws_1"))
        };
        let session = Arc::new(RwLock::new(EditSession::from_document(doc, false)));
        let surface = Arc::new(RecordingSurface::new());
        let (tx, rx) = mpsc::channel(64);
        let controller = PreviewController::new(
            session,
            surface.clone() as Arc<dyn RenderSurface>,
            tx,
            Duration::from_millis(300),
            SandboxPolicy::default(),
        );
        Rig {
            controller,
            surface,
            _events: rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_requests_collapse_into_one_render() {
        let rig = rig_with(vec![FileEntry::code(
            "index.html",
            Language::Html,
            "<p>x</p>",
        )]);
        for _ in 0..4 {
            rig.controller.request_refresh().await;
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(rig.surface.render_count(), 0, "still inside the window");
        sleep(Duration::from_millis(350)).await;
        assert_eq!(rig.surface.render_count(), 1);
        assert!(rig.surface.last().unwrap().contains("<p>x</p>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_renders_immediately() {
        let rig = rig_with(vec![FileEntry::code(
            "index.html",
            Language::Html,
            "<p>now</p>",
        )]);
        rig.controller.refresh_now().await;
        assert_eq!(rig.surface.render_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rootless_session_gets_placeholder() {
        let rig = rig_with(vec![FileEntry::code("styles.css", Language::Css, "a {}")]);
        rig.controller.refresh_now().await;
        assert!(rig.surface.last().unwrap().contains("Add an HTML file"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disposed_controller_ignores_requests() {
        let rig = rig_with(vec![FileEntry::code(
            "index.html",
            Language::Html,
            "<p>x</p>",
        )]);
        rig.controller.dispose().await;
        rig.controller.request_refresh().await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(rig.surface.render_count(), 0);
    }
}
