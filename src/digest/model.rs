// src/digest/model.rs
//! Digest data model: identifiers, the validated filter, posts, summaries and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::prompts::{PromptKind, PromptOverrides, PromptSet};

/// Opaque digest identifier; doubles as scheduler work key and persistence key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigestId(Uuid);

impl DigestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DigestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DigestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DigestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Feed identifier: an absolute http(s) or file URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId(String);

impl FeedId {
    pub fn parse(url: &str) -> Result<Self, FilterError> {
        let trimmed = url.trim();
        match reqwest::Url::parse(trimmed) {
            Ok(u) if matches!(u.scheme(), "http" | "https" | "file") => {
                Ok(Self(trimmed.to_string()))
            }
            _ => Err(FilterError::InvalidFeedUrl(url.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FeedId {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FeedId> for String {
    fn from(value: FeedId) -> Self {
        value.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejections raised before any work is queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("no feeds selected for digest generation")]
    EmptyFeedSet,
    #[error("date_to ({to}) must be after date_from ({from})")]
    InvalidRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    #[error("{field} ({value}) lies in the future")]
    FutureDate {
        field: &'static str,
        value: DateTime<Utc>,
    },
    #[error("invalid feed url: {0}")]
    InvalidFeedUrl(String),
}

/// What to digest: a closed time window over a non-empty, ordered set of feeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestFilter {
    date_from: DateTime<Utc>,
    date_to: DateTime<Utc>,
    feeds: Vec<FeedId>,
    prompt_overrides: PromptOverrides,
}

impl DigestFilter {
    pub fn new(
        date_from: DateTime<Utc>,
        date_to: DateTime<Utc>,
        feeds: Vec<FeedId>,
        prompt_overrides: PromptOverrides,
    ) -> Result<Self, FilterError> {
        Self::new_at(date_from, date_to, feeds, prompt_overrides, Utc::now())
    }

    /// Same as [`DigestFilter::new`] but validated against an explicit `now`.
    pub fn new_at(
        date_from: DateTime<Utc>,
        date_to: DateTime<Utc>,
        feeds: Vec<FeedId>,
        prompt_overrides: PromptOverrides,
        now: DateTime<Utc>,
    ) -> Result<Self, FilterError> {
        // Keep first occurrence so feed order stays the submission order.
        let mut seen = HashSet::new();
        let feeds: Vec<FeedId> = feeds
            .into_iter()
            .filter(|f| seen.insert(f.clone()))
            .collect();

        if feeds.is_empty() {
            return Err(FilterError::EmptyFeedSet);
        }
        if date_to <= date_from {
            return Err(FilterError::InvalidRange {
                from: date_from,
                to: date_to,
            });
        }
        if date_from > now {
            return Err(FilterError::FutureDate {
                field: "date_from",
                value: date_from,
            });
        }
        if date_to > now {
            return Err(FilterError::FutureDate {
                field: "date_to",
                value: date_to,
            });
        }

        Ok(Self {
            date_from,
            date_to,
            feeds,
            prompt_overrides,
        })
    }

    pub fn date_from(&self) -> DateTime<Utc> {
        self.date_from
    }

    pub fn date_to(&self) -> DateTime<Utc> {
        self.date_to
    }

    pub fn feeds(&self) -> &[FeedId] {
        &self.feeds
    }

    pub fn prompt_overrides(&self) -> &PromptOverrides {
        &self.prompt_overrides
    }

    /// True iff `at` falls inside the closed window `[date_from, date_to]`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.date_from <= at && at <= self.date_to
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("importance must be between 1 and 10, inclusive, got {0}")]
pub struct ImportanceError(pub i64);

/// Post importance in `[1, 10]`. Out-of-range values are rejected, never clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct Importance(u8);

impl Importance {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: i64) -> Result<Self, ImportanceError> {
        if (i64::from(Self::MIN)..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(ImportanceError(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Importance {
    type Error = ImportanceError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Importance> for u8 {
    fn from(value: Importance) -> Self {
        value.0
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub feed: FeedId,
    pub content: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    #[serde(flatten)]
    pub post: Post,
    pub summary: String,
    pub importance: Importance,
}

/// Title + overview text returned by the digest-summary AI stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestOverview {
    pub title: String,
    pub overview: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestResult {
    pub id: DigestId,
    /// Fetch order: feed order, then the order each feed returned its posts.
    pub post_summaries: Vec<PostSummary>,
    pub title: String,
    pub overview: String,
    pub posts_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_importance: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
    #[serde(default)]
    pub used_prompts: BTreeMap<PromptKind, String>,
}

impl DigestResult {
    pub fn assemble(
        id: DigestId,
        filter: &DigestFilter,
        post_summaries: Vec<PostSummary>,
        overview: DigestOverview,
        prompts: &PromptSet,
        created_at: DateTime<Utc>,
    ) -> Self {
        let used_prompts = [
            PromptKind::PostSummary,
            PromptKind::PostImportance,
            PromptKind::DigestSummary,
        ]
        .into_iter()
        .map(|k| (k, prompts.stage(k).user.text().to_string()))
        .collect();

        Self {
            id,
            posts_count: post_summaries.len(),
            average_importance: average_importance(&post_summaries),
            post_summaries,
            title: overview.title,
            overview: overview.overview,
            created_at,
            date_from: filter.date_from(),
            date_to: filter.date_to(),
            used_prompts,
        }
    }
}

/// Arithmetic mean of importances; `None` for an empty list.
pub fn average_importance(summaries: &[PostSummary]) -> Option<f64> {
    if summaries.is_empty() {
        return None;
    }
    let total: u64 = summaries
        .iter()
        .map(|s| u64::from(s.importance.get()))
        .sum();
    Some(total as f64 / summaries.len() as f64)
}

/// Digest metadata without posts, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestSummaryView {
    pub id: DigestId,
    pub title: String,
    pub overview: String,
    pub posts_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_importance: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub date_from: DateTime<Utc>,
    pub date_to: DateTime<Utc>,
}

impl From<&DigestResult> for DigestSummaryView {
    fn from(d: &DigestResult) -> Self {
        Self {
            id: d.id,
            title: d.title.clone(),
            overview: d.overview.clone(),
            posts_count: d.posts_count,
            average_importance: d.average_importance,
            created_at: d.created_at,
            date_from: d.date_from,
            date_to: d.date_to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "digest", rename_all = "snake_case")]
pub enum DigestGenerationOutcome {
    Success(DigestResult),
    /// Every selected feed returned zero posts for the window. Not an error.
    NoPosts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub feed: FeedId,
    pub title: String,
    pub description: String,
    pub link: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn feed(s: &str) -> FeedId {
        FeedId::parse(s).unwrap()
    }

    #[test]
    fn filter_rejects_empty_feed_set_and_bad_ranges() {
        let now = Utc::now();
        let from = now - Duration::hours(24);

        assert_eq!(
            DigestFilter::new_at(from, now, vec![], Default::default(), now),
            Err(FilterError::EmptyFeedSet)
        );
        assert!(matches!(
            DigestFilter::new_at(now, from, vec![feed("https://a.test/rss")], Default::default(), now),
            Err(FilterError::InvalidRange { .. })
        ));
        assert!(matches!(
            DigestFilter::new_at(from, from, vec![feed("https://a.test/rss")], Default::default(), now),
            Err(FilterError::InvalidRange { .. })
        ));
        assert!(matches!(
            DigestFilter::new_at(
                from,
                now + Duration::minutes(5),
                vec![feed("https://a.test/rss")],
                Default::default(),
                now
            ),
            Err(FilterError::FutureDate { field: "date_to", .. })
        ));
    }

    #[test]
    fn filter_dedups_feeds_keeping_submission_order() {
        let now = Utc::now();
        let f = DigestFilter::new_at(
            now - Duration::hours(1),
            now,
            vec![
                feed("https://b.test/rss"),
                feed("https://a.test/rss"),
                feed("https://b.test/rss"),
            ],
            Default::default(),
            now,
        )
        .unwrap();
        let urls: Vec<&str> = f.feeds().iter().map(FeedId::as_str).collect();
        assert_eq!(urls, vec!["https://b.test/rss", "https://a.test/rss"]);
    }

    #[test]
    fn feed_id_requires_supported_scheme() {
        assert!(FeedId::parse("https://example.test/feed.xml").is_ok());
        assert!(FeedId::parse("file:///tmp/feed.xml").is_ok());
        assert!(FeedId::parse("ftp://example.test/feed.xml").is_err());
        assert!(FeedId::parse("not a url").is_err());
    }

    #[test]
    fn importance_is_validated_not_clamped() {
        assert_eq!(Importance::new(1).unwrap().get(), 1);
        assert_eq!(Importance::new(10).unwrap().get(), 10);
        assert_eq!(Importance::new(0), Err(ImportanceError(0)));
        assert_eq!(Importance::new(11), Err(ImportanceError(11)));
        assert!(serde_json::from_str::<Importance>("12").is_err());
    }

    #[test]
    fn average_of_empty_list_is_undefined() {
        assert_eq!(average_importance(&[]), None);
    }
}
