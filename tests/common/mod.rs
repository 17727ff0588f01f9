// tests/common/mod.rs
//
// Hand-written collaborators shared by the integration tests:
// - ScriptedFeeds: per-feed canned posts or failures, counts calls
// - CountingAi: records calls and the maximum number in flight at once,
//   can fail on the Nth post or block until released
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use feed_digest::ai_adapter::{AiClient, AiError};
use feed_digest::digest::model::{DigestOverview, FeedMetadata};
use feed_digest::digest::prompts::{PromptSet, StagePrompt};
use feed_digest::digest::{
    AiSlots, DigestFilter, DigestProcessingOrchestrator, DigestScope, FeedId,
    InMemoryDigestRepository, Importance, Post, PostSummary, SharedScopeFactory,
};
use feed_digest::ingest::{FeedClient, FeedError};
use feed_digest::steps::{StepKind, StepLog};

pub fn feed(url: &str) -> FeedId {
    FeedId::parse(url).expect("valid feed url")
}

/// A post published `minutes_ago` before `now`, whose content encodes the importance
/// the counting AI will return for it.
pub fn post(feed_id: &FeedId, name: &str, minutes_ago: i64, importance: u8) -> Post {
    Post {
        feed: feed_id.clone(),
        content: format!("{name} imp={importance}"),
        url: format!("{}/{name}", feed_id.as_str().trim_end_matches("/rss")),
        published_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
    }
}

pub fn last_day_filter(feeds: Vec<FeedId>) -> DigestFilter {
    let now = Utc::now();
    DigestFilter::new_at(
        now - chrono::Duration::hours(24),
        now,
        feeds,
        Default::default(),
        now,
    )
    .expect("valid filter")
}

// ---------------- feeds ----------------

#[derive(Default)]
pub struct ScriptedFeeds {
    scripts: Mutex<HashMap<FeedId, Result<Vec<Post>, u16>>>,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_posts(self, feed_id: &FeedId, posts: Vec<Post>) -> Self {
        self.scripts.lock().insert(feed_id.clone(), Ok(posts));
        self
    }

    /// Fetching this feed fails with the given HTTP status.
    pub fn failing(self, feed_id: &FeedId, status: u16) -> Self {
        self.scripts.lock().insert(feed_id.clone(), Err(status));
        self
    }

    pub fn with_delay(self, d: Duration) -> Self {
        *self.delay.lock() = Some(d);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedClient for ScriptedFeeds {
    async fn fetch_posts(
        &self,
        feed_id: &FeedId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Post>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let script = self.scripts.lock().get(feed_id).cloned();
        match script {
            Some(Ok(posts)) => Ok(posts
                .into_iter()
                .filter(|p| p.published_at >= from && p.published_at <= to)
                .collect()),
            Some(Err(status)) => Err(FeedError::Status(status)),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_feed_info(&self, feed_id: &FeedId) -> Result<FeedMetadata, FeedError> {
        Ok(FeedMetadata {
            feed: feed_id.clone(),
            title: format!("Feed {feed_id}"),
            description: String::new(),
            link: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

// ---------------- AI ----------------

#[derive(Default)]
pub struct CountingAi {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    summarize_calls: AtomicUsize,
    importance_calls: AtomicUsize,
    digest_calls: AtomicUsize,
    fail_on_summary: Option<usize>,
    latency: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
}

impl CountingAi {
    pub fn new() -> Self {
        Self::default()
    }

    /// The Nth (1-based) summarize call fails.
    pub fn failing_on(mut self, nth: usize) -> Self {
        self.fail_on_summary = Some(nth);
        self
    }

    pub fn with_latency(mut self, d: Duration) -> Self {
        self.latency = Some(d);
        self
    }

    /// Every call waits for one permit of `gate` (start it with zero permits to block).
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
            + self.importance_calls.load(Ordering::SeqCst)
            + self.digest_calls.load(Ordering::SeqCst)
    }

    pub fn summarize_calls(&self) -> usize {
        self.summarize_calls.load(Ordering::SeqCst)
    }

    pub fn digest_calls(&self) -> usize {
        self.digest_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        guard
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn encoded_importance(content: &str) -> i64 {
    content
        .split("imp=")
        .nth(1)
        .and_then(|s| s.split_whitespace().next())
        .and_then(|s| s.parse().ok())
        .unwrap_or(5)
}

#[async_trait]
impl AiClient for CountingAi {
    async fn summarize(&self, content: &str, _prompt: &StagePrompt) -> Result<String, AiError> {
        let n = self.summarize_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let _g = self.enter().await;
        if self.fail_on_summary == Some(n) {
            return Err(AiError::Api {
                status: 500,
                body: "upstream exploded".into(),
            });
        }
        Ok(format!("summary of {content}"))
    }

    async fn score_importance(
        &self,
        content: &str,
        _prompt: &StagePrompt,
    ) -> Result<Importance, AiError> {
        self.importance_calls.fetch_add(1, Ordering::SeqCst);
        let _g = self.enter().await;
        let v = encoded_importance(content);
        Importance::new(v).map_err(|_| AiError::InvalidImportance(v.to_string()))
    }

    async fn summarize_digest(
        &self,
        posts: &[PostSummary],
        _prompt: &StagePrompt,
    ) -> Result<DigestOverview, AiError> {
        self.digest_calls.fetch_add(1, Ordering::SeqCst);
        let _g = self.enter().await;
        Ok(DigestOverview {
            title: format!("Digest of {} posts", posts.len()),
            overview: "overview".into(),
        })
    }

    fn provider_name(&self) -> &'static str {
        "counting"
    }
}

// ---------------- harness ----------------

pub struct Harness {
    pub orchestrator: Arc<DigestProcessingOrchestrator>,
    pub repository: Arc<InMemoryDigestRepository>,
    pub steps: Arc<StepLog>,
    pub ai: Arc<CountingAi>,
    pub feeds: Arc<ScriptedFeeds>,
}

pub fn harness(max_concurrent_ai_tasks: usize, feeds: ScriptedFeeds, ai: CountingAi) -> Harness {
    let repository = Arc::new(InMemoryDigestRepository::new());
    let steps = Arc::new(StepLog::new());
    let ai = Arc::new(ai);
    let feeds = Arc::new(feeds);
    let scopes = Arc::new(SharedScopeFactory::new(DigestScope {
        feeds: feeds.clone(),
        ai: ai.clone(),
        repository: repository.clone(),
    }));
    let orchestrator = Arc::new(DigestProcessingOrchestrator::new(
        scopes,
        steps.clone(),
        AiSlots::new(max_concurrent_ai_tasks),
        PromptSet::default(),
    ));
    Harness {
        orchestrator,
        repository,
        steps,
        ai,
        feeds,
    }
}

pub fn kinds(steps: &StepLog, id: feed_digest::DigestId) -> Vec<StepKind> {
    steps.steps(id).into_iter().map(|s| s.kind).collect()
}

/// Poll `cond` every few ms; panic after 5s.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_terminal(steps: &StepLog, id: feed_digest::DigestId) -> StepKind {
    wait_until("terminal step", || steps.is_finished(id)).await;
    steps.last_step(id).expect("has steps").kind
}
