//! Reference rewriting for assembled previews.
//!
//! Workspace files refer to each other by bare file name (`logo.png`,
//! `about.html`). Inside the sandboxed frame those names resolve to
//! nothing, so before assembly:
//!
//! * relative `src`/`href` attribute values and CSS `url()` arguments that
//!   name an uploaded asset are replaced with the asset's stored locator;
//! * `href` values naming a sibling markup file become `href="#"` plus a
//!   `data-page` attribute, handled by the injected navigation shim.
//!
//! Matching is by exact, case-sensitive file name, optionally behind a
//! relative path prefix. Values that are already resolved (scheme or
//! absolute path) are never touched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(src|href)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attr regex")
});

static HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("href regex"));

static CSS_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:'([^']*)'|"([^"]*)"|([^)'"\s]+))\s*\)"#).expect("url regex")
});

static STRUCTURAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<!doctype[^>]*>|</?(?:html|head|body)\b[^>]*>").expect("structural regex")
});

/// Closing tags as injection anchors. `</body>` doubles as the marker
/// separating structured documents from fragments.
pub(crate) static CLOSE_HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</head\s*>").expect("head regex"));

pub(crate) static CLOSE_BODY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</body\s*>").expect("body regex"));

/// Click-delegation shim injected whenever the workspace has sibling
/// markup files. Page links post a navigate request to the host instead
/// of tearing down the frame.
pub(crate) const NAV_SHIM: &str = r#"document.addEventListener('click', function (event) {
  var link = event.target.closest('a[data-page]');
  if (!link) return;
  event.preventDefault();
  parent.postMessage({ type: 'navigate', page: link.getAttribute('data-page') }, '*');
});"#;

/// True for values worth resolving: no scheme, not absolute, not a pure
/// fragment. Everything else is already usable inside the frame.
fn is_relative(value: &str) -> bool {
    if value.is_empty() || value.starts_with('/') || value.starts_with('#') {
        return false;
    }
    // A colon before the first slash means a scheme (https:, data:, mailto:).
    if let Some(colon) = value.find(':') {
        let slash = value.find('/').unwrap_or(usize::MAX);
        if colon < slash {
            return false;
        }
    }
    true
}

/// Resolves a relative value against the asset table: the bare name, or
/// the name behind any relative path prefix. Never partial names.
fn match_asset<'a>(value: &str, assets: &[(&str, &'a str)]) -> Option<&'a str> {
    if !is_relative(value) {
        return None;
    }
    assets.iter().find_map(|(name, url)| {
        (value == *name || value.ends_with(&format!("/{name}"))).then_some(*url)
    })
}

/// Rewrites `src`/`href` attribute values naming an uploaded asset.
pub(crate) fn rewrite_asset_attrs(markup: &str, assets: &[(&str, &str)]) -> String {
    if assets.is_empty() {
        return markup.to_owned();
    }
    ATTR_RE
        .replace_all(markup, |caps: &Captures<'_>| {
            let attr = &caps[1];
            let (quote, value) = match (caps.get(2), caps.get(3)) {
                (Some(v), _) => ('"', v.as_str()),
                (_, Some(v)) => ('\'', v.as_str()),
                _ => return caps[0].to_owned(),
            };
            match match_asset(value, assets) {
                Some(url) => format!("{attr}={quote}{url}{quote}"),
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Rewrites CSS `url(...)` arguments naming an uploaded asset. Quoting
/// style is preserved.
pub(crate) fn rewrite_css_urls(css: &str, assets: &[(&str, &str)]) -> String {
    if assets.is_empty() {
        return css.to_owned();
    }
    CSS_URL_RE
        .replace_all(css, |caps: &Captures<'_>| {
            let (value, quote) = if let Some(v) = caps.get(1) {
                (v.as_str(), Some('\''))
            } else if let Some(v) = caps.get(2) {
                (v.as_str(), Some('"'))
            } else if let Some(v) = caps.get(3) {
                (v.as_str(), None)
            } else {
                return caps[0].to_owned();
            };
            match match_asset(value, assets) {
                Some(url) => match quote {
                    Some(q) => format!("url({q}{url}{q})"),
                    None => format!("url({url})"),
                },
                None => caps[0].to_owned(),
            }
        })
        .into_owned()
}

/// Turns `href` values that exactly name a sibling markup file into
/// `href="#"` + `data-page`. Path-prefixed values are deliberately left
/// alone: sibling pages live in a flat namespace.
pub(crate) fn rewrite_page_links(markup: &str, pages: &[&str]) -> String {
    if pages.is_empty() {
        return markup.to_owned();
    }
    HREF_RE
        .replace_all(markup, |caps: &Captures<'_>| {
            let (quote, value) = match (caps.get(1), caps.get(2)) {
                (Some(v), _) => ('"', v.as_str()),
                (_, Some(v)) => ('\'', v.as_str()),
                _ => return caps[0].to_owned(),
            };
            if pages.contains(&value) {
                format!("href={quote}#{quote} data-page={quote}{value}{quote}")
            } else {
                caps[0].to_owned()
            }
        })
        .into_owned()
}

/// Drops top-level structural tags so a fragment can be reparented into
/// the synthesized wrapper.
pub(crate) fn strip_structural_tags(markup: &str) -> String {
    STRUCTURAL_RE.replace_all(markup, "").into_owned()
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ASSETS: &[(&str, &str)] = &[
        ("logo.png", "mem://uploads/logo.png"),
        ("bg.jpg", "mem://uploads/bg.jpg"),
    ];

    // ── Attribute rewriting ──────────────────────────────────────

    #[test]
    fn test_exact_name_is_rewritten() {
        let out = rewrite_asset_attrs(r#"<img src="logo.png">"#, ASSETS);
        assert_eq!(out, r#"<img src="mem://uploads/logo.png">"#);
    }

    #[test]
    fn test_partial_name_is_not_rewritten() {
        let markup = r#"<img src="hero-logo.png"><img src="logo.png.bak">"#;
        assert_eq!(rewrite_asset_attrs(markup, ASSETS), markup);
    }

    #[test]
    fn test_relative_prefix_is_rewritten() {
        let out = rewrite_asset_attrs(
            r#"<img src="./logo.png"><img src="img/logo.png">"#,
            ASSETS,
        );
        assert_eq!(
            out,
            r#"<img src="mem://uploads/logo.png"><img src="mem://uploads/logo.png">"#
        );
    }

    #[test]
    fn test_resolved_values_are_left_alone() {
        let markup = concat!(
            r#"<img src="/logo.png">"#,
            r#"<img src="https://cdn.example.com/logo.png">"#,
            r#"<img src="//cdn.example.com/logo.png">"#,
            r#"<img src="data:image/png;base64,AAAA">"#,
            r##"<a href="#logo.png">x</a>"##,
            r#"<a href="mailto:logo.png">x</a>"#,
        );
        assert_eq!(rewrite_asset_attrs(markup, ASSETS), markup);
    }

    #[test]
    fn test_matching_is_case_sensitive_on_names() {
        let markup = r#"<img src="Logo.png">"#;
        assert_eq!(rewrite_asset_attrs(markup, ASSETS), markup);
    }

    #[test]
    fn test_attribute_name_is_case_insensitive() {
        let out = rewrite_asset_attrs(r#"<IMG SRC="logo.png">"#, ASSETS);
        assert_eq!(out, r#"<IMG SRC="mem://uploads/logo.png">"#);
    }

    #[test]
    fn test_single_quotes_are_preserved() {
        let out = rewrite_asset_attrs("<img src='logo.png'>", ASSETS);
        assert_eq!(out, "<img src='mem://uploads/logo.png'>");
    }

    #[test]
    fn test_href_assets_are_rewritten_too() {
        let out = rewrite_asset_attrs(r#"<a href="bg.jpg">bg</a>"#, ASSETS);
        assert_eq!(out, r#"<a href="mem://uploads/bg.jpg">bg</a>"#);
    }

    // ── CSS url() rewriting ──────────────────────────────────────

    #[test]
    fn test_css_url_quote_forms() {
        let css = "a { background: url(bg.jpg) } b { background: url('bg.jpg') } c { background: url(\"bg.jpg\") }";
        let out = rewrite_css_urls(css, ASSETS);
        assert_eq!(
            out,
            "a { background: url(mem://uploads/bg.jpg) } b { background: url('mem://uploads/bg.jpg') } c { background: url(\"mem://uploads/bg.jpg\") }"
        );
    }

    #[test]
    fn test_css_url_skips_resolved_values() {
        let css = "a { background: url(https://x/bg.jpg) } b { background: url(/bg.jpg) }";
        assert_eq!(rewrite_css_urls(css, ASSETS), css);
    }

    #[test]
    fn test_css_url_relative_prefix() {
        let out = rewrite_css_urls("a { background: url(./bg.jpg) }", ASSETS);
        assert_eq!(out, "a { background: url(mem://uploads/bg.jpg) }");
    }

    // ── Page links ───────────────────────────────────────────────

    #[test]
    fn test_page_link_exact_match_only() {
        let pages = ["about.html"];
        let out = rewrite_page_links(
            r#"<a href="about.html">About</a> <a href="./about.html">rel</a>"#,
            &pages,
        );
        assert_eq!(
            out,
            r##"<a href="#" data-page="about.html">About</a> <a href="./about.html">rel</a>"##
        );
    }

    #[test]
    fn test_page_link_preserves_single_quotes() {
        let out = rewrite_page_links("<a href='about.html'>x</a>", &["about.html"]);
        assert_eq!(out, "<a href='#' data-page='about.html'>x</a>");
    }

    #[test]
    fn test_non_page_hrefs_untouched() {
        let markup = r#"<a href="contact.html">c</a>"#;
        assert_eq!(rewrite_page_links(markup, &["about.html"]), markup);
    }

    // ── Structural stripping ─────────────────────────────────────

    #[test]
    fn test_strip_structural_tags() {
        let markup = "<!DOCTYPE html>\n<html lang=\"en\"><head></head><body class=\"x\"><p>keep</p></body></html>";
        assert_eq!(strip_structural_tags(markup).trim(), "<p>keep</p>");
    }

    #[test]
    fn test_strip_leaves_content_tags() {
        let markup = "<header><h1>t</h1></header>";
        assert_eq!(strip_structural_tags(markup), markup);
    }
}
