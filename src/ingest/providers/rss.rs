use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::de::from_str;
use serde::Deserialize;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::digest::model::{FeedId, FeedMetadata, Post};
use crate::ingest::types::{FeedClient, FeedError};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    description: Option<String>,
    link: Option<String>,
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
}

fn parse_published(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    let odt = OffsetDateTime::parse(ts, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc3339))
        .ok()?;
    DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), odt.nanosecond())
}

/// RSS 2.0 feed client. Fixture mode serves in-memory documents keyed by feed URL;
/// live mode fetches `http(s)` feeds with reqwest and reads `file://` feeds from disk.
pub struct RssFeedClient {
    mode: Mode,
}

enum Mode {
    Fixtures(HashMap<String, String>),
    Live { client: reqwest::Client },
}

impl RssFeedClient {
    pub fn new(timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("feed-digest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            mode: Mode::Live { client },
        })
    }

    pub fn from_fixtures<I, K, V>(docs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            mode: Mode::Fixtures(
                docs.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    async fn load(&self, feed: &FeedId) -> Result<String, FeedError> {
        match &self.mode {
            Mode::Fixtures(docs) => docs
                .get(feed.as_str())
                .cloned()
                .ok_or_else(|| FeedError::InvalidUrl(feed.to_string())),
            Mode::Live { client } => {
                let url = reqwest::Url::parse(feed.as_str())
                    .map_err(|_| FeedError::InvalidUrl(feed.to_string()))?;
                match url.scheme() {
                    "file" => {
                        let path = url
                            .to_file_path()
                            .map_err(|_| FeedError::InvalidUrl(feed.to_string()))?;
                        tokio::fs::read_to_string(&path)
                            .await
                            .map_err(|e| FeedError::Parse(format!("{}: {e}", path.display())))
                    }
                    "http" | "https" => {
                        let resp = client.get(url).send().await?;
                        if !resp.status().is_success() {
                            return Err(FeedError::Status(resp.status().as_u16()));
                        }
                        Ok(resp.text().await?)
                    }
                    _ => Err(FeedError::InvalidUrl(feed.to_string())),
                }
            }
        }
    }

    async fn load_channel(&self, feed: &FeedId) -> Result<Channel, FeedError> {
        let body = self.load(feed).await.inspect_err(|e| {
            tracing::warn!(error = %e, feed = %feed, "feed download failed");
            counter!("digest_feed_errors_total").increment(1);
        })?;
        let t0 = std::time::Instant::now();
        let rss: Rss = from_str(&scrub_html_entities_for_xml(&body)).map_err(|e| {
            counter!("digest_feed_errors_total").increment(1);
            FeedError::Parse(e.to_string())
        })?;
        histogram!("digest_feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        Ok(rss.channel)
    }

    fn posts_in_window(
        feed: &FeedId,
        channel: Channel,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Post>, FeedError> {
        let mut out = Vec::new();
        for it in channel.item {
            let Some(published_at) = it.pub_date.as_deref().and_then(parse_published) else {
                tracing::debug!(feed = %feed, title = ?it.title, "item without usable pubDate skipped");
                continue;
            };
            if published_at < from || published_at > to {
                continue;
            }

            let url = it
                .link
                .or(it.guid)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    FeedError::Parse(format!(
                        "item '{}' has no link",
                        it.title.as_deref().unwrap_or_default()
                    ))
                })?;

            let mut content = crate::ingest::normalize_text(it.description.as_deref().unwrap_or_default());
            if content.is_empty() {
                content = crate::ingest::normalize_text(it.title.as_deref().unwrap_or_default());
            }
            if content.is_empty() {
                continue;
            }

            out.push(Post {
                feed: feed.clone(),
                content,
                url,
                published_at,
            });
        }
        // Stable: items with equal timestamps keep document order.
        out.sort_by_key(|p| p.published_at);
        Ok(out)
    }
}

#[async_trait]
impl FeedClient for RssFeedClient {
    async fn fetch_posts(
        &self,
        feed: &FeedId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Post>, FeedError> {
        let channel = self.load_channel(feed).await?;
        let posts = Self::posts_in_window(feed, channel, from, to)?;
        tracing::debug!(feed = %feed, posts = posts.len(), "feed read");
        Ok(posts)
    }

    async fn fetch_feed_info(&self, feed: &FeedId) -> Result<FeedMetadata, FeedError> {
        let channel = self.load_channel(feed).await?;
        Ok(FeedMetadata {
            feed: feed.clone(),
            title: channel
                .title
                .map(|t| crate::ingest::normalize_text(&t))
                .unwrap_or_else(|| feed.to_string()),
            description: channel
                .description
                .map(|d| crate::ingest::normalize_text(&d))
                .unwrap_or_default(),
            link: channel.link,
        })
    }

    fn name(&self) -> &'static str {
        "rss"
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
