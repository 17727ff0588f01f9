//! Append-only, per-digest log of lifecycle events, read by progress pollers.
//!
//! A digest's log is a sequence of runs. `Queued` or `ProcessingStarted` may open a new
//! run after a terminal step; any other step after a terminal is rejected. Entries are
//! never rewritten or removed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::digest::model::{DigestId, FeedId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Queued,
    ProcessingStarted,
    RssReadingStarted {
        feeds: Vec<FeedId>,
    },
    RssReadingFinished {
        posts_count: usize,
    },
    AiProcessing {
        percent_complete: u8,
    },
    NoPostsFound,
    Success,
    Cancelled,
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<String>,
    },
}

impl StepKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepKind::NoPostsFound | StepKind::Success | StepKind::Cancelled | StepKind::Error { .. }
        )
    }

    /// Kinds allowed to start a new run once the previous one has terminated.
    pub fn opens_run(&self) -> bool {
        matches!(self, StepKind::Queued | StepKind::ProcessingStarted)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Queued => "queued",
            StepKind::ProcessingStarted => "processing_started",
            StepKind::RssReadingStarted { .. } => "rss_reading_started",
            StepKind::RssReadingFinished { .. } => "rss_reading_finished",
            StepKind::AiProcessing { .. } => "ai_processing",
            StepKind::NoPostsFound => "no_posts_found",
            StepKind::Success => "success",
            StepKind::Cancelled => "cancelled",
            StepKind::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>, cause: Option<String>) -> Self {
        StepKind::Error {
            message: message.into(),
            cause,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestStep {
    pub digest_id: DigestId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepLogError {
    #[error("digest {id} already finished with '{last}', rejected '{rejected}'")]
    Terminated {
        id: DigestId,
        last: &'static str,
        rejected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    Queued,
    InProgress,
    Completed,
    NoPosts,
    Cancelled,
    Failed,
}

/// Progress of the most recent run, as rendered by progress UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestProgress {
    pub id: DigestId,
    pub percent_complete: u8,
    pub status: DigestStatus,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

type Entries = Arc<Mutex<Vec<DigestStep>>>;

/// Concurrent append from many runs, concurrent reads from pollers.
/// The outer map lock is only held to find/create a digest's entry.
#[derive(Debug, Default)]
pub struct StepLog {
    by_digest: RwLock<HashMap<DigestId, Entries>>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self, id: DigestId) -> Entries {
        if let Some(e) = self.by_digest.read().get(&id) {
            return e.clone();
        }
        self.by_digest.write().entry(id).or_default().clone()
    }

    pub fn append(&self, id: DigestId, kind: StepKind) -> Result<DigestStep, StepLogError> {
        let entries = self.entries(id);
        let mut v = entries.lock();

        let mut timestamp = Utc::now();
        if let Some(last) = v.last() {
            if last.kind.is_terminal() && !kind.opens_run() {
                return Err(StepLogError::Terminated {
                    id,
                    last: last.kind.name(),
                    rejected: kind.name(),
                });
            }
            // Per-digest order is strictly by append; keep timestamps non-decreasing.
            timestamp = timestamp.max(last.timestamp);
        }

        let step = DigestStep {
            digest_id: id,
            timestamp,
            kind,
        };
        tracing::debug!(target: "steps", digest_id = %id, step = step.kind.name(), "step recorded");
        v.push(step.clone());
        Ok(step)
    }

    /// Full history for `id`, oldest first. Empty if unknown.
    pub fn steps(&self, id: DigestId) -> Vec<DigestStep> {
        match self.by_digest.read().get(&id) {
            Some(e) => e.lock().clone(),
            None => Vec::new(),
        }
    }

    /// Steps of the most recent run only.
    pub fn latest_run(&self, id: DigestId) -> Vec<DigestStep> {
        let mut all = self.steps(id);
        let start = all
            .windows(2)
            .rposition(|w| w[0].kind.is_terminal())
            .map(|i| i + 1)
            .unwrap_or(0);
        all.split_off(start)
    }

    pub fn last_step(&self, id: DigestId) -> Option<DigestStep> {
        self.by_digest
            .read()
            .get(&id)
            .and_then(|e| e.lock().last().cloned())
    }

    pub fn is_finished(&self, id: DigestId) -> bool {
        self.last_step(id).is_some_and(|s| s.kind.is_terminal())
    }

    pub fn digest_ids(&self) -> Vec<DigestId> {
        self.by_digest.read().keys().copied().collect()
    }

    pub fn progress(&self, id: DigestId) -> Option<DigestProgress> {
        let run = self.latest_run(id);
        let first = run.first()?;
        let last = run.last()?;

        let mut percent = run
            .iter()
            .filter_map(|s| match s.kind {
                StepKind::AiProcessing { percent_complete } => Some(percent_complete),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let (status, message) = match &last.kind {
            StepKind::Queued => (DigestStatus::Queued, None),
            StepKind::Success => {
                percent = 100;
                (DigestStatus::Completed, None)
            }
            StepKind::NoPostsFound => {
                percent = 100;
                (
                    DigestStatus::NoPosts,
                    Some("No posts found in the selected window".to_string()),
                )
            }
            StepKind::Cancelled => (DigestStatus::Cancelled, None),
            StepKind::Error { message, .. } => (DigestStatus::Failed, Some(message.clone())),
            _ => (DigestStatus::InProgress, None),
        };

        Some(DigestProgress {
            id,
            percent_complete: percent,
            status,
            message,
            started_at: first.timestamp,
            completed_at: last.kind.is_terminal().then_some(last.timestamp),
        })
    }
}
