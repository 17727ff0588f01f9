// src/ingest/types.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::digest::model::{FeedId, FeedMetadata, Post};

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed responded with status {0}")]
    Status(u16),
    #[error("feed could not be parsed: {0}")]
    Parse(String),
    #[error("feed url is not supported: {0}")]
    InvalidUrl(String),
}

/// Source of posts for a single feed.
///
/// `fetch_posts` returns posts with `from <= published_at <= to`, in chronological order.
/// Failures are returned, never panicked.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn fetch_posts(
        &self,
        feed: &FeedId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Post>, FeedError>;

    async fn fetch_feed_info(&self, feed: &FeedId) -> Result<FeedMetadata, FeedError>;

    fn name(&self) -> &'static str;
}
