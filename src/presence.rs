//! Collaborator presence: who is in the workspace, where, and how we say so.
//!
//! The registry half is pure derivation over the shared document's
//! `presence` list; it never writes. The broadcaster half is the only
//! writer of the local user's entry, and the only place stale entries get
//! pruned.
//!
//! ```text
//! cursor move ──► cursor_moved() ── debounce 200ms ──┐
//! focus change ─► announce_active_file() ────────────┤ (immediate)
//!                                                    ▼
//!                             publish(): fetch ► upsert own entry
//!                                       ► prune ≥30s ► presence patch
//!                                                    │
//!                                                    ▼
//!                                          shared document store
//! ```
//!
//! An entry is live while `now − lastSeen` stays strictly under 30s.
//! Publishing is best-effort telemetry: every failure is swallowed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::document::{CursorPosition, DocumentPatch, PresenceEntry, WorkspaceDocument};
use crate::schedule::Debounce;
use crate::session::{emit, SessionEvent, SharedSession};
use crate::store::{DocumentStore, StoreError};

/// Liveness window. An entry whose age reaches this is excluded and will
/// be pruned by the next publisher.
pub const PRESENCE_TTL_MS: i64 = 30_000;

// ───────────────────────────────────────────────────────────────────
// Registry (pure)
// ───────────────────────────────────────────────────────────────────

pub fn is_live(entry: &PresenceEntry, now: DateTime<Utc>) -> bool {
    (now - entry.last_seen) < chrono::Duration::milliseconds(PRESENCE_TTL_MS)
}

/// One live remote collaborator, colored for display.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub email: String,
    pub active_file: Option<String>,
    pub cursor: Option<CursorPosition>,
    pub color: CollaboratorColor,
    pub last_seen: DateTime<Utc>,
}

/// Everything the collaborator strip needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRoster {
    pub local_online: bool,
    pub peers: Vec<PeerPresence>,
}

/// Derives the visible roster: live peers (stale and local entries
/// excluded), in stable email order. The local user always reads as
/// online in their own roster; liveness filtering applies to peers
/// only, so a viewer who never broadcasts still sees themselves there.
pub fn roster(presence: &[PresenceEntry], local_email: &str, now: DateTime<Utc>) -> PresenceRoster {
    let mut peers: Vec<PeerPresence> = presence
        .iter()
        .filter(|p| p.email != local_email && is_live(p, now))
        .map(|p| PeerPresence {
            color: CollaboratorColor::from_email(&p.email),
            email: p.email.clone(),
            active_file: p.active_file.clone(),
            cursor: p.cursor,
            last_seen: p.last_seen,
        })
        .collect();
    peers.sort_by(|a, b| a.email.cmp(&b.email));
    PresenceRoster { local_online: true, peers }
}

/// A remote caret to decorate inside one editor pane.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub email: String,
    pub color: CollaboratorColor,
    pub line: u32,
    pub column: u32,
}

/// Live remote cursors inside the given file, in stable email order.
pub fn cursors_for_file(
    presence: &[PresenceEntry],
    local_email: &str,
    file_id: Uuid,
    now: DateTime<Utc>,
) -> Vec<RemoteCursor> {
    let mut cursors: Vec<RemoteCursor> = presence
        .iter()
        .filter(|p| p.email != local_email && is_live(p, now))
        .filter_map(|p| {
            let cursor = p.cursor?;
            (cursor.file_id == file_id).then(|| RemoteCursor {
                email: p.email.clone(),
                color: CollaboratorColor::from_email(&p.email),
                line: cursor.line,
                column: cursor.column,
            })
        })
        .collect();
    cursors.sort_by(|a, b| a.email.cmp(&b.email));
    cursors
}

/// Replaces the entry with the same email, or appends.
pub fn upsert(presence: &mut Vec<PresenceEntry>, entry: PresenceEntry) {
    match presence.iter_mut().find(|p| p.email == entry.email) {
        Some(slot) => *slot = entry,
        None => presence.push(entry),
    }
}

/// Drops every entry at or past the liveness window.
pub fn prune_stale(presence: &mut Vec<PresenceEntry>, now: DateTime<Utc>) {
    presence.retain(|p| is_live(p, now));
}

// ───────────────────────────────────────────────────────────────────
// Collaborator colors
// ───────────────────────────────────────────────────────────────────

/// Stable, visually distinct color for a collaborator.
///
/// The hue is derived from a hash of the email so every client renders
/// the same person in the same color; saturation and lightness are fixed
/// for vivid but readable carets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl CollaboratorColor {
    pub fn from_email(email: &str) -> Self {
        let hue = ((stable_hash(email) % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        CollaboratorColor {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// CSS hex form, e.g. `#4fc08d`.
    pub fn css(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// FNV-1a. Hashing must agree across processes, so no `RandomState`.
fn stable_hash(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    let r = hue_to_rgb(p, q, h + 1.0 / 3.0);
    let g = hue_to_rgb(p, q, h);
    let b = hue_to_rgb(p, q, h - 1.0 / 3.0);

    (r, g, b)
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

// ───────────────────────────────────────────────────────────────────
// Broadcaster
// ───────────────────────────────────────────────────────────────────

/// Publishes the local user's presence into the shared document.
///
/// Focus changes go out immediately, cursor positions through a trailing
/// debounce so a typing burst collapses into one write carrying the final
/// position. Cheap to clone; clones share one debounce.
#[derive(Clone)]
pub(crate) struct PresenceBroadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    store: Arc<dyn DocumentStore>,
    session: SharedSession,
    email: String,
    events: mpsc::Sender<SessionEvent>,
    debounce: Debounce,
    window: Duration,
    read_only: bool,
    /// Latest local caret, kept across publishes until focus moves.
    cursor: Mutex<Option<CursorPosition>>,
}

impl PresenceBroadcaster {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        session: SharedSession,
        email: String,
        events: mpsc::Sender<SessionEvent>,
        window: Duration,
        read_only: bool,
    ) -> Self {
        PresenceBroadcaster {
            inner: Arc::new(BroadcasterInner {
                store,
                session,
                email,
                events,
                debounce: Debounce::new(),
                window,
                read_only,
                cursor: Mutex::new(None),
            }),
        }
    }

    /// Records the caret and arms the trailing publish. Every call within
    /// the window replaces the pending one.
    pub(crate) async fn cursor_moved(&self, cursor: CursorPosition) {
        if self.inner.read_only {
            return;
        }
        *self.inner.cursor.lock().await = Some(cursor);
        let this = self.clone();
        self.inner
            .debounce
            .schedule(self.inner.window, move || async move {
                this.publish().await;
            })
            .await;
    }

    /// Publishes the focused file right away. The previous file's caret is
    /// dropped along with any pending cursor publish.
    pub(crate) async fn announce_active_file(&self) {
        if self.inner.read_only {
            return;
        }
        *self.inner.cursor.lock().await = None;
        self.inner.debounce.cancel().await;
        self.publish().await;
    }

    pub(crate) async fn dispose(&self) {
        self.inner.debounce.dispose().await;
    }

    async fn publish(&self) {
        if let Err(err) = self.try_publish().await {
            // Telemetry only; the next publish supersedes this one anyway.
            log::debug!("presence publish skipped: {err}");
        }
    }

    async fn try_publish(&self) -> Result<(), StoreError> {
        let (id, active_file) = {
            let session = self.inner.session.read().await;
            let active = session
                .focused()
                .and_then(|id| session.file(id))
                .map(|f| f.name.clone());
            (session.workspace_id().clone(), active)
        };

        let raw = self.inner.store.get(&id).await?;
        let doc = WorkspaceDocument::decode(&id, raw);
        let mut presence = doc.presence;

        let now = Utc::now();
        let cursor = *self.inner.cursor.lock().await;
        upsert(
            &mut presence,
            PresenceEntry {
                email: self.inner.email.clone(),
                active_file,
                cursor,
                last_seen: now,
            },
        );
        prune_stale(&mut presence, now);

        let patch = DocumentPatch::presence(presence.clone(), self.inner.email.clone())
            .into_value()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let written = self.inner.store.update(&id, patch).await?;
        let stamp = WorkspaceDocument::decode(&id, written).updated_at;

        let changed = {
            let mut session = self.inner.session.write().await;
            session.record_written(stamp);
            session.merge_presence(presence)
        };
        if changed {
            emit(&self.inner.events, SessionEvent::PresenceChanged);
        }
        Ok(())
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{FileEntry, Language, WorkspaceId};
    use crate::session::EditSession;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::sync::RwLock;
    use tokio::time::sleep;

    fn entry(email: &str, age_ms: i64, now: DateTime<Utc>) -> PresenceEntry {
        PresenceEntry::new(email, now - chrono::Duration::milliseconds(age_ms))
    }

    // ── Liveness tests ───────────────────────────────────────────

    #[test]
    fn test_liveness_boundary_is_exclusive() {
        let now = Utc::now();
        assert!(is_live(&entry("a@x.com", 29_999, now), now));
        assert!(!is_live(&entry("a@x.com", 30_000, now), now));
        assert!(!is_live(&entry("a@x.com", 30_001, now), now));
    }

    #[test]
    fn test_roster_excludes_stale_and_local() {
        let now = Utc::now();
        let presence = vec![
            entry("me@x.com", 1_000, now),
            entry("fresh@x.com", 2_000, now),
            entry("gone@x.com", 31_000, now),
        ];
        let roster = roster(&presence, "me@x.com", now);
        assert!(roster.local_online);
        assert_eq!(roster.peers.len(), 1);
        assert_eq!(roster.peers[0].email, "fresh@x.com");
    }

    #[test]
    fn test_roster_orders_peers_by_email() {
        let now = Utc::now();
        let presence = vec![
            entry("zoe@x.com", 0, now),
            entry("ada@x.com", 0, now),
            entry("mia@x.com", 0, now),
        ];
        let roster = roster(&presence, "me@x.com", now);
        let emails: Vec<&str> = roster.peers.iter().map(|p| p.email.as_str()).collect();
        assert_eq!(emails, vec!["ada@x.com", "mia@x.com", "zoe@x.com"]);
    }

    #[test]
    fn test_local_user_always_reports_online() {
        let now = Utc::now();
        // No entry at all: a viewer who never broadcasts.
        assert!(roster(&[], "me@x.com", now).local_online);
        // A stale own entry: writable session idle past the window.
        let idle = vec![entry("me@x.com", 31_000, now)];
        let roster = roster(&idle, "me@x.com", now);
        assert!(roster.local_online);
        assert!(roster.peers.is_empty());
    }

    #[test]
    fn test_cursors_scoped_to_file_and_liveness() {
        let now = Utc::now();
        let file_a = Uuid::new_v4();
        let file_b = Uuid::new_v4();
        let mut here = entry("here@x.com", 0, now);
        here.cursor = Some(CursorPosition { file_id: file_a, line: 3, column: 7 });
        let mut elsewhere = entry("elsewhere@x.com", 0, now);
        elsewhere.cursor = Some(CursorPosition { file_id: file_b, line: 1, column: 1 });
        let mut stale = entry("stale@x.com", 40_000, now);
        stale.cursor = Some(CursorPosition { file_id: file_a, line: 9, column: 9 });
        let mut me = entry("me@x.com", 0, now);
        me.cursor = Some(CursorPosition { file_id: file_a, line: 5, column: 5 });

        let cursors = cursors_for_file(&[here, elsewhere, stale, me], "me@x.com", file_a, now);
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].email, "here@x.com");
        assert_eq!((cursors[0].line, cursors[0].column), (3, 7));
    }

    #[test]
    fn test_upsert_replaces_by_email() {
        let now = Utc::now();
        let mut presence = vec![entry("a@x.com", 10_000, now)];
        upsert(&mut presence, entry("a@x.com", 0, now));
        upsert(&mut presence, entry("b@x.com", 0, now));
        assert_eq!(presence.len(), 2);
        assert_eq!(presence[0].last_seen, now);
    }

    #[test]
    fn test_prune_drops_entries_at_ttl() {
        let now = Utc::now();
        let mut presence = vec![
            entry("keep@x.com", 29_999, now),
            entry("drop@x.com", 30_000, now),
        ];
        prune_stale(&mut presence, now);
        assert_eq!(presence.len(), 1);
        assert_eq!(presence[0].email, "keep@x.com");
    }

    // ── Color tests ──────────────────────────────────────────────

    #[test]
    fn test_color_is_stable_per_email() {
        let a1 = CollaboratorColor::from_email("ada@example.com");
        let a2 = CollaboratorColor::from_email("ada@example.com");
        let b = CollaboratorColor::from_email("grace@example.com");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn test_color_css_format() {
        let color = CollaboratorColor { r: 0x4f, g: 0xc0, b: 0x8d };
        assert_eq!(color.css(), "#4fc08d");
    }

    // ── Broadcaster tests ────────────────────────────────────────

    struct Rig {
        store: Arc<MemoryStore>,
        session: SharedSession,
        broadcaster: PresenceBroadcaster,
        _events: mpsc::Receiver<SessionEvent>,
        file_id: Uuid,
    }

    async fn rig(read_only: bool) -> Rig {
        let store = Arc::new(MemoryStore::new());
        let html = FileEntry::code("index.html", Language::Html, "<p>hi</p>");
        let file_id = html.id;
        store
            .create(json!({
                "id": "ws_1",
                "title": "T",
                "files": [serde_json::to_value(&html).unwrap()],
                "presence": []
            }))
            .await
            .unwrap();
        let doc = WorkspaceDocument::decode(
            &WorkspaceId::from("ws_1"),
            store.get(&WorkspaceId::from("ws_1")).await.unwrap(),
        );
        let session = Arc::new(RwLock::new(EditSession::from_document(doc, read_only)));
        let (tx, rx) = mpsc::channel(64);
        let broadcaster = PresenceBroadcaster::new(
            store.clone() as Arc<dyn DocumentStore>,
            session.clone(),
            "me@example.com".to_owned(),
            tx,
            Duration::from_millis(200),
            read_only,
        );
        Rig { store, session, broadcaster, _events: rx, file_id }
    }

    fn pos(file_id: Uuid, line: u32, column: u32) -> CursorPosition {
        CursorPosition { file_id, line, column }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_burst_collapses_to_one_write() {
        let rig = rig(false).await;
        for line in 1..=5 {
            rig.broadcaster.cursor_moved(pos(rig.file_id, line, 1)).await;
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rig.store.stats().updates, 0, "nothing before the window");
        sleep(Duration::from_millis(250)).await;
        assert_eq!(rig.store.stats().updates, 1);

        let raw = rig.store.raw(&WorkspaceId::from("ws_1")).await.unwrap();
        let written = &raw["presence"][0];
        assert_eq!(written["email"], json!("me@example.com"));
        assert_eq!(written["cursor"]["line"], json!(5), "last position wins");
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_publishes_immediately() {
        let rig = rig(false).await;
        rig.broadcaster.announce_active_file().await;
        assert_eq!(rig.store.stats().updates, 1);
        let raw = rig.store.raw(&WorkspaceId::from("ws_1")).await.unwrap();
        assert_eq!(raw["presence"][0]["activeFile"], json!("index.html"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_announce_supersedes_pending_cursor() {
        let rig = rig(false).await;
        rig.broadcaster.cursor_moved(pos(rig.file_id, 2, 2)).await;
        rig.broadcaster.announce_active_file().await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.store.stats().updates, 1, "debounced publish cancelled");
        let raw = rig.store.raw(&WorkspaceId::from("ws_1")).await.unwrap();
        assert!(raw["presence"][0].get("cursor").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_prunes_stale_entries() {
        let rig = rig(false).await;
        let stale = PresenceEntry::new(
            "gone@example.com",
            Utc::now() - chrono::Duration::seconds(45),
        );
        rig.store
            .update(
                &WorkspaceId::from("ws_1"),
                json!({ "presence": [serde_json::to_value(&stale).unwrap()] }),
            )
            .await
            .unwrap();

        rig.broadcaster.announce_active_file().await;
        let raw = rig.store.raw(&WorkspaceId::from("ws_1")).await.unwrap();
        let emails: Vec<&str> = raw["presence"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p["email"].as_str())
            .collect();
        assert_eq!(emails, vec!["me@example.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failures_are_swallowed() {
        let rig = rig(false).await;
        rig.store.inject_fault(StoreError::Backend("down".into())).await;
        rig.broadcaster.announce_active_file().await;
        assert_eq!(rig.store.stats().updates, 0);
        // Session untouched, next publish succeeds.
        rig.broadcaster.announce_active_file().await;
        assert_eq!(rig.store.stats().updates, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_records_written_stamp() {
        let rig = rig(false).await;
        rig.broadcaster.announce_active_file().await;
        let raw = rig.store.raw(&WorkspaceId::from("ws_1")).await.unwrap();
        let stamp = WorkspaceDocument::decode(&WorkspaceId::from("ws_1"), raw).updated_at;
        assert!(stamp.is_some());
        let session = rig.session.read().await;
        assert_eq!(session.last_written_updated_at(), stamp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_sessions_stay_silent() {
        let rig = rig(true).await;
        let gets_after_rig = rig.store.stats().gets;
        rig.broadcaster.announce_active_file().await;
        rig.broadcaster.cursor_moved(pos(rig.file_id, 1, 1)).await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(rig.store.stats().updates, 0);
        assert_eq!(rig.store.stats().gets, gets_after_rig, "no publish fetch");
    }
}
