// src/digest/orchestrator.rs
//! Entry point for digest generation: runs digests directly or through the task
//! scheduler, and keeps the step log in step with both paths.

use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

use super::model::{DigestFilter, DigestGenerationOutcome, DigestId, FeedId, FeedMetadata};
use super::pipeline::{terminal_step, AiSlots, DigestError, DigestPipeline};
use super::prompts::PromptSet;
use super::repository::DigestRepository;
use crate::analyze::ai_adapter::AiClient;
use crate::ingest::types::{FeedClient, FeedError};
use crate::scheduler::{CancelOutcome, SchedulerError, TaskError, TaskScheduler, WorkItem};
use crate::steps::{DigestProgress, DigestStep, StepKind, StepLog};

/// Collaborators for one digest run.
#[derive(Clone)]
pub struct DigestScope {
    pub feeds: Arc<dyn FeedClient>,
    pub ai: Arc<dyn AiClient>,
    pub repository: Arc<dyn DigestRepository>,
}

/// Produces a fresh [`DigestScope`] each time a run starts. Queued runs call it at
/// execution time, not at enqueue time.
pub trait ScopeFactory: Send + Sync {
    fn create_scope(&self) -> DigestScope;
}

/// Hands out the same long-lived collaborators to every run.
pub struct SharedScopeFactory {
    scope: DigestScope,
}

impl SharedScopeFactory {
    pub fn new(scope: DigestScope) -> Self {
        Self { scope }
    }
}

impl ScopeFactory for SharedScopeFactory {
    fn create_scope(&self) -> DigestScope {
        self.scope.clone()
    }
}

/// Everything a run needs besides the scope.
#[derive(Clone)]
struct Processor {
    steps: Arc<StepLog>,
    scopes: Arc<dyn ScopeFactory>,
    slots: AiSlots,
    prompts: PromptSet,
}

impl Processor {
    async fn process(
        &self,
        scope: DigestScope,
        id: DigestId,
        filter: &DigestFilter,
        cancel: &CancellationToken,
    ) -> Result<DigestGenerationOutcome, DigestError> {
        if let Err(e) = self.steps.append(id, StepKind::ProcessingStarted) {
            debug!(target: "digest", digest_id = %id, error = %e, "processing start not recorded");
        }
        info!(target: "digest", digest_id = %id, feeds = filter.feeds().len(), "processing digest");
        DigestPipeline::new(scope, self.steps.clone(), self.slots.clone(), self.prompts.clone())
            .generate_digest(id, filter, cancel)
            .await
    }
}

pub struct DigestProcessingOrchestrator {
    processor: Processor,
    scheduler: TaskScheduler<DigestId, StepKind>,
}

impl DigestProcessingOrchestrator {
    /// Starts one scheduler worker per AI slot. Must be called inside a Tokio runtime.
    pub fn new(
        scopes: Arc<dyn ScopeFactory>,
        steps: Arc<StepLog>,
        slots: AiSlots,
        prompts: PromptSet,
    ) -> Self {
        let scheduler = TaskScheduler::start(slots.capacity());
        Self {
            processor: Processor {
                steps,
                scopes,
                slots,
                prompts,
            },
            scheduler,
        }
    }

    /// Run a digest now, on the caller's task. Failures are returned as-is.
    pub async fn process_digest(
        &self,
        id: DigestId,
        filter: &DigestFilter,
        cancel: &CancellationToken,
    ) -> Result<DigestGenerationOutcome, DigestError> {
        let scope = self.processor.scopes.create_scope();
        let result = self.processor.process(scope, id, filter, cancel).await;
        if let Err(e) = self.processor.steps.append(id, terminal_step(&result)) {
            debug!(target: "digest", digest_id = %id, error = %e, "terminal step not recorded");
        }
        result
    }

    /// Queue a digest. Returns once the scheduler has admitted it; `Queued` is recorded
    /// only when admission succeeds. The terminal step is recorded by the scheduler
    /// handlers as the id is released, so an id whose run looks finished can be queued again.
    pub fn queue_digest(
        &self,
        id: DigestId,
        filter: DigestFilter,
        cancel: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let processor = self.processor.clone();
        let admitted_log = self.processor.steps.clone();
        let success_log = self.processor.steps.clone();
        let error_log = self.processor.steps.clone();

        let item = WorkItem::new(id, move |token: CancellationToken| async move {
            if token.is_cancelled() || cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let (merged, _guard) = merged_token(&token, &cancel);
            let scope = processor.scopes.create_scope();
            match processor.process(scope, id, &filter, &merged).await {
                Ok(outcome) => Ok(outcome.terminal_step()),
                Err(e) if e.is_cancelled() => Err(TaskError::Cancelled),
                Err(e) => Err(TaskError::failed(&e)),
            }
        })
        .on_admitted(move || {
            if let Err(e) = admitted_log.append(id, StepKind::Queued) {
                debug!(target: "digest", digest_id = %id, error = %e, "queued step not recorded");
            }
            counter!("digest_queued_total").increment(1);
        })
        .on_success(move |kind| {
            if let Err(e) = success_log.append(id, kind) {
                debug!(target: "digest", digest_id = %id, error = %e, "terminal step not recorded");
            }
        })
        .on_error(move |err| {
            let kind = match err {
                TaskError::Cancelled => StepKind::Cancelled,
                TaskError::Failed { message, cause } => StepKind::Error { message, cause },
                TaskError::Panicked(msg) => StepKind::error("digest processing panicked", Some(msg)),
            };
            if let Err(e) = error_log.append(id, kind) {
                debug!(target: "digest", digest_id = %id, error = %e, "terminal step not recorded");
            }
        });

        self.scheduler.enqueue(item)
    }

    pub fn cancel(&self, id: DigestId) -> Result<CancelOutcome, SchedulerError> {
        self.scheduler.cancel(&id)
    }

    pub fn list_waiting(&self) -> Vec<DigestId> {
        self.scheduler.list_waiting()
    }

    pub fn list_running(&self) -> Vec<DigestId> {
        self.scheduler.list_running()
    }

    pub fn list_cancellation_requested(&self) -> Vec<DigestId> {
        self.scheduler.list_cancellation_requested()
    }

    pub fn get_steps(&self, id: DigestId) -> Vec<DigestStep> {
        self.processor.steps.steps(id)
    }

    pub fn progress(&self, id: DigestId) -> Option<DigestProgress> {
        self.processor.steps.progress(id)
    }

    pub fn step_log(&self) -> &Arc<StepLog> {
        &self.processor.steps
    }

    pub fn repository(&self) -> Arc<dyn DigestRepository> {
        self.processor.scopes.create_scope().repository
    }

    pub async fn fetch_feed_info(&self, feed: &FeedId) -> Result<FeedMetadata, FeedError> {
        self.processor.scopes.create_scope().feeds.fetch_feed_info(feed).await
    }

    /// Stop the scheduler: waiting digests are recorded cancelled, running ones are signalled.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.scheduler.join().await;
    }
}

/// Token that fires when either input fires. Dropping the guard stops the forwarder.
fn merged_token(scheduler: &CancellationToken, caller: &CancellationToken) -> (CancellationToken, DropGuard) {
    let merged = scheduler.child_token();
    if caller.is_cancelled() {
        merged.cancel();
    }
    let guard = merged.clone().drop_guard();
    let (caller, target) = (caller.clone(), merged.clone());
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => target.cancel(),
            _ = target.cancelled() => {}
        }
    });
    (merged, guard)
}
