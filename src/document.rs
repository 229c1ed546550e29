//! Workspace document model shared with the remote JSON store.
//!
//! Documents arrive as untrusted JSON through the store client, so decoding
//! is total: a malformed `files` field degrades to an empty list, malformed
//! entries inside it are skipped with a warning, and a document that fails
//! to parse at all falls back to an empty workspace. A corrupt write can
//! never lock a session out.
//!
//! ## Store shape
//!
//! ```text
//! {
//!   "id": "ws_9f2a",
//!   "title": "Landing page",
//!   "files":    [ { "id", "name", "kind", "language", "code", "size" } ],
//!   "presence": [ { "email", "activeFile", "cursor", "lastSeen" } ],
//!   "lastModifiedBy": "ada@example.com",
//!   "updatedAt": "2025-01-07T12:30:00Z"
//! }
//! ```
//!
//! Field names are camelCase on the wire; unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// Opaque store key of a workspace document.
///
/// The store assigns these; the engine never inspects their structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        WorkspaceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(id: &str) -> Self {
        WorkspaceId(id.to_owned())
    }
}

impl From<String> for WorkspaceId {
    fn from(id: String) -> Self {
        WorkspaceId(id)
    }
}

// ───────────────────────────────────────────────────────────────────
// Languages
// ───────────────────────────────────────────────────────────────────

/// Source language of a code file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Html,
    Css,
    Scss,
    JavaScript,
    TypeScript,
    Jsx,
    Tsx,
    Json,
    Markdown,
}

/// Behavioral grouping used by the preview compiler.
///
/// All script variants are treated identically during assembly; the
/// compiler does not transpile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageFamily {
    Markup,
    Style,
    Script,
    Data,
}

impl Language {
    pub fn family(self) -> LanguageFamily {
        match self {
            Language::Html => LanguageFamily::Markup,
            Language::Css | Language::Scss => LanguageFamily::Style,
            Language::JavaScript | Language::TypeScript | Language::Jsx | Language::Tsx => {
                LanguageFamily::Script
            }
            Language::Json | Language::Markdown => LanguageFamily::Data,
        }
    }

    /// Seed content for a freshly created file of this language.
    pub fn template(self, name: &str) -> String {
        let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(name);
        match self {
            Language::Html => format!("<h1>{stem}</h1>\n"),
            Language::Css | Language::Scss => format!("/* {name} */\n"),
            Language::JavaScript | Language::TypeScript | Language::Jsx | Language::Tsx => {
                format!("// {name}\n")
            }
            Language::Json => "{}\n".to_owned(),
            Language::Markdown => format!("# {stem}\n"),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Files
// ───────────────────────────────────────────────────────────────────

/// Payload of a file entry: editable source or an uploaded asset locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FileContent {
    Code { language: Language, code: String },
    Asset { url: String },
}

/// One entry in a workspace's flat file list.
///
/// `id` is stable across renames and never reused; `name` is unique within
/// the list (enforced by the session, not by serde). `size` is an advisory
/// byte length recomputed on every edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub content: FileContent,
    #[serde(default)]
    pub size: u64,
}

impl FileEntry {
    pub fn code(name: impl Into<String>, language: Language, code: impl Into<String>) -> Self {
        let code = code.into();
        FileEntry {
            id: Uuid::new_v4(),
            name: name.into(),
            size: code.len() as u64,
            content: FileContent::Code { language, code },
        }
    }

    pub fn asset(name: impl Into<String>, url: impl Into<String>) -> Self {
        FileEntry {
            id: Uuid::new_v4(),
            name: name.into(),
            content: FileContent::Asset { url: url.into() },
            size: 0,
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self.content, FileContent::Code { .. })
    }

    pub fn is_asset(&self) -> bool {
        matches!(self.content, FileContent::Asset { .. })
    }

    pub fn language(&self) -> Option<Language> {
        match &self.content {
            FileContent::Code { language, .. } => Some(*language),
            FileContent::Asset { .. } => None,
        }
    }

    pub fn family(&self) -> Option<LanguageFamily> {
        self.language().map(Language::family)
    }

    pub fn code_text(&self) -> Option<&str> {
        match &self.content {
            FileContent::Code { code, .. } => Some(code),
            FileContent::Asset { .. } => None,
        }
    }

    pub fn asset_url(&self) -> Option<&str> {
        match &self.content {
            FileContent::Asset { url } => Some(url),
            FileContent::Code { .. } => None,
        }
    }

    /// Replaces the source text of a code file and refreshes `size`.
    /// No-op on assets.
    pub fn set_code(&mut self, new_code: String) {
        if let FileContent::Code { code, .. } = &mut self.content {
            self.size = new_code.len() as u64;
            *code = new_code;
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence
// ───────────────────────────────────────────────────────────────────

/// Caret location inside a specific file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub file_id: Uuid,
    pub line: u32,
    pub column: u32,
}

/// One collaborator's heartbeat inside the shared document.
///
/// Keyed by `email`. An entry is live while `now - last_seen` stays under
/// the 30s presence TTL; producers prune stale entries when they publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    pub last_seen: DateTime<Utc>,
}

impl PresenceEntry {
    pub fn new(email: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        PresenceEntry {
            email: email.into(),
            active_file: None,
            cursor: None,
            last_seen,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

/// A full workspace document as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceDocument {
    #[serde(default)]
    pub id: WorkspaceId,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_files")]
    pub files: Vec<FileEntry>,
    #[serde(default, deserialize_with = "lenient_presence")]
    pub presence: Vec<PresenceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WorkspaceDocument {
    pub fn empty(id: WorkspaceId) -> Self {
        WorkspaceDocument {
            id,
            title: String::new(),
            files: Vec::new(),
            presence: Vec::new(),
            last_modified_by: None,
            updated_at: None,
        }
    }

    /// Decodes a raw store value. Total: structurally broken documents fall
    /// back to an empty workspace under the requested id.
    pub fn decode(id: &WorkspaceId, value: Value) -> Self {
        match serde_json::from_value::<WorkspaceDocument>(value) {
            Ok(mut doc) => {
                if doc.id.as_str().is_empty() {
                    doc.id = id.clone();
                }
                doc
            }
            Err(err) => {
                log::warn!("workspace {id}: undecodable document ({err}), using empty fallback");
                WorkspaceDocument::empty(id.clone())
            }
        }
    }

    pub fn file(&self, id: Uuid) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn file_by_name(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }
}

fn lenient_files<'de, D>(de: D) -> Result<Vec<FileEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(de)?;
    Ok(lenient_vec(raw, "file"))
}

fn lenient_presence<'de, D>(de: D) -> Result<Vec<PresenceEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(de)?;
    Ok(lenient_vec(raw, "presence"))
}

/// Deserializes each array element independently so one bad entry cannot
/// poison the rest. Non-array input yields an empty list.
fn lenient_vec<T: serde::de::DeserializeOwned>(raw: Value, what: &str) -> Vec<T> {
    let Value::Array(items) = raw else {
        if !raw.is_null() {
            log::warn!("{what} list is not an array, dropping it");
        }
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<T>(item) {
            Ok(entry) => out.push(entry),
            Err(err) => log::warn!("skipping malformed {what} entry: {err}"),
        }
    }
    out
}

// ───────────────────────────────────────────────────────────────────
// Patches
// ───────────────────────────────────────────────────────────────────

/// Partial update sent to the store. Absent fields are left untouched by
/// the store's shallow merge, which is what keeps content commits and
/// presence heartbeats from clobbering each other.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<String>,
}

impl DocumentPatch {
    /// Content commit: title + files + author, presence untouched.
    pub fn content(title: String, files: Vec<FileEntry>, author: String) -> Self {
        DocumentPatch {
            title: Some(title),
            files: Some(files),
            presence: None,
            last_modified_by: Some(author),
        }
    }

    /// Presence heartbeat: presence + author, content untouched.
    pub fn presence(presence: Vec<PresenceEntry>, author: String) -> Self {
        DocumentPatch {
            title: None,
            files: None,
            presence: Some(presence),
            last_modified_by: Some(author),
        }
    }

    pub fn into_value(self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

// ───────────────────────────────────────────────────────────────────
// Starter content
// ───────────────────────────────────────────────────────────────────

const STARTER_HTML: &str = "<main class=\"welcome\">\n  <h1>New workspace</h1>\n  <p>Edit <code>index.html</code> to get started.</p>\n</main>\n";

const STARTER_CSS: &str = "body {\n  margin: 0;\n  font-family: system-ui, sans-serif;\n}\n\n.welcome {\n  padding: 2rem;\n}\n";

const STARTER_JS: &str = "console.log(\"workspace ready\");\n";

/// File set seeded into brand-new or emptied-out workspaces.
pub fn starter_files() -> Vec<FileEntry> {
    vec![
        FileEntry::code("index.html", Language::Html, STARTER_HTML),
        FileEntry::code("styles.css", Language::Css, STARTER_CSS),
        FileEntry::code("app.js", Language::JavaScript, STARTER_JS),
    ]
}

// ===================================================================
// Tests
// ===================================================================
