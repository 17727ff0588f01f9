// src/digest/pipeline.rs
//! One digest run: fetch every selected feed, summarize and score each post under the
//! shared AI-slot budget, roll the summaries into a digest, persist it.
//!
//! All-or-nothing: the first feed or AI failure aborts the run and nothing is saved.
//! Cancellation is observed before every AI call and while waiting for a slot.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::try_join_all;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{
    DigestFilter, DigestGenerationOutcome, DigestId, DigestResult, FeedId, Post, PostSummary,
};
use super::orchestrator::DigestScope;
use super::prompts::PromptSet;
use super::repository::{DigestRepository, RepositoryError};
use crate::analyze::ai_adapter::{AiClient, AiError};
use crate::ingest::types::{FeedClient, FeedError};
use crate::steps::{StepKind, StepLog};

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("failed to read feed {feed}")]
    Feed {
        feed: FeedId,
        #[source]
        source: FeedError,
    },
    #[error("{context}")]
    Ai {
        context: String,
        #[source]
        source: AiError,
    },
    #[error("failed to save digest")]
    Persistence(#[from] RepositoryError),
    #[error("digest generation was cancelled")]
    Cancelled,
}

impl DigestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DigestError::Cancelled)
    }

    /// Message of the underlying cause, if any.
    pub fn cause(&self) -> Option<String> {
        std::error::Error::source(self).map(ToString::to_string)
    }

    pub fn terminal_step(&self) -> StepKind {
        match self {
            DigestError::Cancelled => StepKind::Cancelled,
            other => StepKind::error(other.to_string(), other.cause()),
        }
    }
}

impl DigestGenerationOutcome {
    pub fn terminal_step(&self) -> StepKind {
        match self {
            DigestGenerationOutcome::Success(_) => StepKind::Success,
            DigestGenerationOutcome::NoPosts => StepKind::NoPostsFound,
        }
    }
}

/// Step that closes a run ending with `result`.
pub fn terminal_step(result: &Result<DigestGenerationOutcome, DigestError>) -> StepKind {
    match result {
        Ok(outcome) => outcome.terminal_step(),
        Err(e) => e.terminal_step(),
    }
}

/// Process-wide AI call budget. Build once at start-up and clone into every pipeline.
#[derive(Debug, Clone)]
pub struct AiSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the duration of AI work; releases its slot on drop.
#[derive(Debug)]
pub struct AiSlot {
    _permit: OwnedSemaphorePermit,
}

impl Drop for AiSlot {
    fn drop(&mut self) {
        gauge!("digest_ai_inflight").decrement(1.0);
    }
}

impl AiSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot, giving up if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<AiSlot, DigestError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DigestError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        // The semaphore is never closed.
        let permit = permit.map_err(|_| DigestError::Cancelled)?;
        gauge!("digest_ai_inflight").increment(1.0);
        Ok(AiSlot { _permit: permit })
    }
}

pub struct DigestPipeline {
    feeds: Arc<dyn FeedClient>,
    ai: Arc<dyn AiClient>,
    repository: Arc<dyn DigestRepository>,
    steps: Arc<StepLog>,
    slots: AiSlots,
    prompts: PromptSet,
}

impl DigestPipeline {
    pub fn new(scope: DigestScope, steps: Arc<StepLog>, slots: AiSlots, prompts: PromptSet) -> Self {
        Self {
            feeds: scope.feeds,
            ai: scope.ai,
            repository: scope.repository,
            steps,
            slots,
            prompts,
        }
    }

    /// Run the digest, recording progress steps. The terminal step is left to the caller
    /// (see [`terminal_step`]) so it can be published together with releasing the run.
    pub async fn generate_digest(
        &self,
        id: DigestId,
        filter: &DigestFilter,
        cancel: &CancellationToken,
    ) -> Result<DigestGenerationOutcome, DigestError> {
        let started = Instant::now();
        let result = self.run(id, filter, cancel).await;
        histogram!("digest_generation_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let outcome = match &result {
            Ok(DigestGenerationOutcome::Success(d)) => {
                info!(target: "digest", digest_id = %id, posts = d.posts_count, "digest generated");
                "success"
            }
            Ok(DigestGenerationOutcome::NoPosts) => {
                info!(target: "digest", digest_id = %id, "no posts in window");
                "no_posts"
            }
            Err(DigestError::Cancelled) => {
                info!(target: "digest", digest_id = %id, "digest cancelled");
                "cancelled"
            }
            Err(e) => {
                warn!(target: "digest", digest_id = %id, error = %e, cause = ?e.cause(), "digest failed");
                "error"
            }
        };
        counter!("digest_completed_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run(
        &self,
        id: DigestId,
        filter: &DigestFilter,
        cancel: &CancellationToken,
    ) -> Result<DigestGenerationOutcome, DigestError> {
        let prompts = filter.prompt_overrides().resolve(&self.prompts);

        // 1. Fetch all feeds concurrently; first failure wins.
        self.record(
            id,
            StepKind::RssReadingStarted {
                feeds: filter.feeds().to_vec(),
            },
        );
        let fetches = filter.feeds().iter().map(|feed| async move {
            self.feeds
                .fetch_posts(feed, filter.date_from(), filter.date_to())
                .await
                .map_err(|source| DigestError::Feed {
                    feed: feed.clone(),
                    source,
                })
        });
        let per_feed = until_cancelled(cancel, try_join_all(fetches)).await?;
        let posts: Vec<Post> = per_feed
            .into_iter()
            .flatten()
            .filter(|p| filter.contains(p.published_at))
            .collect();
        let total = posts.len();
        self.record(id, StepKind::RssReadingFinished { posts_count: total });
        debug!(target: "digest", digest_id = %id, posts = total, feeds = filter.feeds().len(), "feeds read");

        // 2. Empty window.
        if posts.is_empty() {
            return Ok(DigestGenerationOutcome::NoPosts);
        }

        // 3. Per-post AI, bounded by the shared slots; results keep fetch order.
        let done = Mutex::new(0usize);
        let summaries = try_join_all(
            posts
                .into_iter()
                .map(|post| self.summarize_post(id, post, &prompts, cancel, &done, total)),
        )
        .await?;

        // 4. Digest overview.
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }
        let overview = {
            let _slot = self.slots.acquire(cancel).await?;
            if cancel.is_cancelled() {
                return Err(DigestError::Cancelled);
            }
            counter!("digest_ai_calls_total", "stage" => "digest_summary").increment(1);
            until_cancelled(
                cancel,
                self.ai.summarize_digest(&summaries, &prompts.digest_summary),
            )
            .await
            .map_err(|e| e.ai("failed to summarize digest"))?
        };

        // 5. Assemble + persist.
        let digest = DigestResult::assemble(id, filter, summaries, overview, &prompts, Utc::now());
        self.repository.save_digest(&digest).await?;
        Ok(DigestGenerationOutcome::Success(digest))
    }

    async fn summarize_post(
        &self,
        id: DigestId,
        post: Post,
        prompts: &PromptSet,
        cancel: &CancellationToken,
        done: &Mutex<usize>,
        total: usize,
    ) -> Result<PostSummary, DigestError> {
        let slot = self.slots.acquire(cancel).await?;
        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }

        counter!("digest_ai_calls_total", "stage" => "post_summary").increment(1);
        let summary = until_cancelled(cancel, self.ai.summarize(&post.content, &prompts.post_summary))
            .await
            .map_err(|e| e.ai(format!("failed to summarize post {}", post.url)))?;

        if cancel.is_cancelled() {
            return Err(DigestError::Cancelled);
        }
        counter!("digest_ai_calls_total", "stage" => "post_importance").increment(1);
        let importance = until_cancelled(
            cancel,
            self.ai.score_importance(&post.content, &prompts.post_importance),
        )
        .await
        .map_err(|e| e.ai(format!("failed to evaluate importance for post {}", post.url)))?;
        drop(slot);

        {
            // Count and record under one lock so percentages are appended in order.
            let mut n = done.lock();
            *n += 1;
            let percent_complete = (*n * 100 / total) as u8;
            self.record(id, StepKind::AiProcessing { percent_complete });
        }

        Ok(PostSummary {
            post,
            summary,
            importance,
        })
    }

    fn record(&self, id: DigestId, kind: StepKind) {
        if let Err(e) = self.steps.append(id, kind) {
            debug!(target: "digest", digest_id = %id, error = %e, "step not recorded");
        }
    }
}

/// Either the future's own error, or cancellation if the token fires first.
enum Interrupted<E> {
    Cancelled,
    Failed(E),
}

impl Interrupted<AiError> {
    fn ai(self, context: impl Into<String>) -> DigestError {
        match self {
            Interrupted::Cancelled => DigestError::Cancelled,
            Interrupted::Failed(source) => DigestError::Ai {
                context: context.into(),
                source,
            },
        }
    }
}

impl From<Interrupted<DigestError>> for DigestError {
    fn from(value: Interrupted<DigestError>) -> Self {
        match value {
            Interrupted::Cancelled => DigestError::Cancelled,
            Interrupted::Failed(e) => e,
        }
    }
}

async fn until_cancelled<T, E, F>(cancel: &CancellationToken, fut: F) -> Result<T, Interrupted<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match cancel.run_until_cancelled(fut).await {
        Some(r) => r.map_err(Interrupted::Failed),
        None => Err(Interrupted::Cancelled),
    }
}
