// src/ingest/config.rs
//! Feed list for scheduled and one-shot digests.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::digest::model::FeedId;

pub const ENV_FEEDS_PATH: &str = "DIGEST_FEEDS_PATH";

/// Load the feed list from an explicit path. Supports TOML (`feeds = [..]`) or a JSON array.
pub fn load_feeds_from(path: &Path) -> Result<Vec<FeedId>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading feed list from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_feeds(&content, ext.as_str())
        .with_context(|| format!("parsing feed list {}", path.display()))
}

/// Load the feed list using env var + fallbacks:
/// 1) $DIGEST_FEEDS_PATH
/// 2) config/feeds.toml
/// 3) config/feeds.json
pub fn load_feeds_default() -> Result<Vec<FeedId>> {
    if let Ok(p) = std::env::var(ENV_FEEDS_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_feeds_from(&pb);
        }
        return Err(anyhow!("{ENV_FEEDS_PATH} points to non-existent path"));
    }
    let toml_p = PathBuf::from("config/feeds.toml");
    if toml_p.exists() {
        return load_feeds_from(&toml_p);
    }
    let json_p = PathBuf::from("config/feeds.json");
    if json_p.exists() {
        return load_feeds_from(&json_p);
    }
    Ok(Vec::new())
}

fn parse_feeds(s: &str, hint_ext: &str) -> Result<Vec<FeedId>> {
    let raw = if hint_ext == "json" || s.trim_start().starts_with('[') {
        parse_json(s)?
    } else {
        parse_toml(s)?
    };
    clean_list(raw)
}

fn parse_toml(s: &str) -> Result<Vec<String>> {
    #[derive(serde::Deserialize)]
    struct TomlFeeds {
        feeds: Vec<String>,
    }
    let v: TomlFeeds = toml::from_str(s)?;
    Ok(v.feeds)
}

fn parse_json(s: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(s)?)
}

/// Trim, drop blanks and duplicates, keep file order.
fn clean_list(items: Vec<String>) -> Result<Vec<FeedId>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for it in items {
        let t = it.trim();
        if t.is_empty() || !seen.insert(t.to_string()) {
            continue;
        }
        out.push(FeedId::parse(t)?);
    }
    Ok(out)
}
