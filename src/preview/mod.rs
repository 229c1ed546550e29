//! Preview compiler: deterministic assembly of workspace files into one
//! self-contained HTML document for the sandboxed frame.
//!
//! ```text
//! files ──► partition by family ──► style block   (css + scss, file order)
//!   │                          ──► script block  (js/ts/jsx/tsx, file order)
//!   │
//!   └─► root markup ──► asset refs ──► page links ──► structured?
//!                                                   ├─ yes: inject into
//!                                                   │       <head>/<body>
//!                                                   └─ no:  synthesize
//!                                                           wrapper page
//! ```
//!
//! Compilation is pure: the same file set and root always produce byte
//! identical output, so the render surface can be replaced wholesale
//! without flicker-diffing. The script variants are not transpiled; they
//! are concatenated as-is and the browser gets what the user wrote.
//!
//! ## Performance
//!
//! | Metric | Target |
//! |--------|--------|
//! | 10-file workspace compile | <1ms |
//! | Rewrite passes | single scan each |

mod frame;
mod rewrite;

pub use frame::{
    parse_frame_message, FrameMessage, RecordingSurface, RenderSurface, SandboxPolicy,
};
pub(crate) use frame::PreviewController;

use std::fmt;
use uuid::Uuid;

use crate::document::{FileEntry, LanguageFamily};
use rewrite::{
    rewrite_asset_attrs, rewrite_css_urls, rewrite_page_links, strip_structural_tags,
    CLOSE_BODY_RE, CLOSE_HEAD_RE, NAV_SHIM,
};

// ───────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────

/// Output of one compile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPreview {
    pub html: String,
    pub root: Uuid,
    pub root_name: String,
    /// Whether the root carried its own document structure.
    pub structured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    RootNotFound(Uuid),
    /// The chosen root exists but is not a markup code file.
    RootNotMarkup(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::RootNotFound(id) => write!(f, "preview root {id} not in file set"),
            CompileError::RootNotMarkup(name) => {
                write!(f, "preview root {name:?} is not a markup file")
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// The markup file a fresh session previews: the first one in file order.
pub fn default_preview_root(files: &[FileEntry]) -> Option<Uuid> {
    files
        .iter()
        .find(|f| f.family() == Some(LanguageFamily::Markup))
        .map(|f| f.id)
}

// ───────────────────────────────────────────────────────────────────
// Compilation
// ───────────────────────────────────────────────────────────────────

/// Assembles the file set into one HTML document rooted at `root_id`.
pub fn compile(files: &[FileEntry], root_id: Uuid) -> Result<CompiledPreview, CompileError> {
    let root = files
        .iter()
        .find(|f| f.id == root_id)
        .ok_or(CompileError::RootNotFound(root_id))?;
    let markup = match (root.family(), root.code_text()) {
        (Some(LanguageFamily::Markup), Some(code)) => code,
        _ => return Err(CompileError::RootNotMarkup(root.name.clone())),
    };

    let assets: Vec<(&str, &str)> = files
        .iter()
        .filter_map(|f| Some((f.name.as_str(), f.asset_url()?)))
        .collect();
    let pages: Vec<&str> = files
        .iter()
        .filter(|f| f.id != root_id && f.family() == Some(LanguageFamily::Markup))
        .map(|f| f.name.as_str())
        .collect();

    let style_block = {
        let joined = collect_family(files, LanguageFamily::Style);
        rewrite_css_urls(&joined, &assets)
    };
    let script_block = build_script_block(&collect_family(files, LanguageFamily::Script), &pages);

    let body = rewrite_asset_attrs(markup, &assets);
    let body = rewrite_page_links(&body, &pages);

    let structured = CLOSE_BODY_RE.is_match(&body);
    let html = if structured {
        assemble_structured(&body, &style_block, &script_block)
    } else {
        assemble_fragment(&body, &style_block, &script_block)
    };

    Ok(CompiledPreview {
        html,
        root: root_id,
        root_name: root.name.clone(),
        structured,
    })
}

/// Concatenates the code of every file in the family, in file order.
fn collect_family(files: &[FileEntry], family: LanguageFamily) -> String {
    let parts: Vec<&str> = files
        .iter()
        .filter(|f| f.family() == Some(family))
        .filter_map(FileEntry::code_text)
        .filter(|code| !code.trim().is_empty())
        .collect();
    parts.join("\n")
}

/// Shim first (navigation must survive a broken user script), then the
/// user's code wrapped so exceptions land in the embedded console instead
/// of killing the frame.
fn build_script_block(user_script: &str, pages: &[&str]) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !pages.is_empty() {
        parts.push(NAV_SHIM.to_owned());
    }
    if !user_script.trim().is_empty() {
        parts.push(format!(
            "try {{\n{}\n}} catch (err) {{\n  console.error('Preview script error:', err);\n}}",
            user_script.trim_end()
        ));
    }
    parts.join("\n")
}

fn assemble_structured(body: &str, style_block: &str, script_block: &str) -> String {
    let mut html = body.to_owned();
    if !style_block.is_empty() {
        let tag = format!("<style>\n{style_block}\n</style>\n");
        let at = CLOSE_HEAD_RE
            .find(&html)
            .map(|m| m.start())
            .or_else(|| CLOSE_BODY_RE.find_iter(&html).last().map(|m| m.start()));
        match at {
            Some(idx) => html = insert_at(&html, idx, &tag),
            None => html.push_str(&tag),
        }
    }
    if !script_block.is_empty() {
        let tag = format!("<script>\n{script_block}\n</script>\n");
        match CLOSE_BODY_RE.find_iter(&html).last().map(|m| m.start()) {
            Some(idx) => html = insert_at(&html, idx, &tag),
            None => html.push_str(&tag),
        }
    }
    html
}

fn assemble_fragment(body: &str, style_block: &str, script_block: &str) -> String {
    let fragment = strip_structural_tags(body);
    let fragment = fragment.trim();
    let mut html = String::with_capacity(
        fragment.len() + style_block.len() + script_block.len() + 256,
    );
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    if !style_block.is_empty() {
        html.push_str("<style>\n");
        html.push_str(style_block);
        html.push_str("\n</style>\n");
    }
    html.push_str("</head>\n<body>\n");
    html.push_str(fragment);
    html.push('\n');
    if !script_block.is_empty() {
        html.push_str("<script>\n");
        html.push_str(script_block);
        html.push_str("\n</script>\n");
    }
    html.push_str("</body>\n</html>\n");
    html
}

fn insert_at(html: &str, idx: usize, insertion: &str) -> String {
    let mut out = String::with_capacity(html.len() + insertion.len());
    out.push_str(&html[..idx]);
    out.push_str(insertion);
    out.push_str(&html[idx..]);
    out
}

// ===================================================================
// Tests
// ===================================================================
