// src/ingest/mod.rs
pub mod config;
pub mod providers;
pub mod scheduler;
pub mod types;

pub use providers::RssFeedClient;
pub use types::{FeedClient, FeedError};

use once_cell::sync::Lazy;
use regex::Regex;

/// Post content handed to the AI stages is capped at this many characters.
pub const MAX_CONTENT_CHARS: usize = 4000;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Turn feed HTML into plain text: decode entities, strip tags, ASCII quotes,
/// collapsed whitespace, length cap.
pub fn normalize_text(s: &str) -> String {
    // Tags before entities so encoded `&lt;b&gt;` survives as text.
    let stripped = RE_TAGS.replace_all(s, " ");
    let mut out = html_escape::decode_html_entities(&stripped).to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    out = RE_WS.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_CONTENT_CHARS {
        out = out.chars().take(MAX_CONTENT_CHARS).collect();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_markup_and_collapses_ws() {
        let s = "  <p>Hello,&nbsp;&nbsp; <b>world</b>!</p>\n\n \u{201C}quoted\u{201D} ";
        assert_eq!(normalize_text(s), "Hello, world ! \"quoted\"");
    }

    #[test]
    fn normalize_text_keeps_encoded_markup_as_text() {
        assert_eq!(normalize_text("a &lt;b&gt; c"), "a <b> c");
    }

    #[test]
    fn normalize_text_caps_length() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 10);
        assert_eq!(normalize_text(&long).chars().count(), MAX_CONTENT_CHARS);
    }
}
