// src/ingest/scheduler.rs
//! Daily digest: once a day at a fixed UTC time, queue a digest over the configured
//! feeds for the preceding window, and mail it when it succeeds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Days, NaiveTime, Utc};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::digest::model::{DigestFilter, DigestId, FeedId};
use crate::digest::orchestrator::DigestProcessingOrchestrator;
use crate::ingest::config::{load_feeds_default, load_feeds_from};
use crate::notify::DigestMailer;
use crate::steps::StepKind;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct DailyDigestCfg {
    pub at: NaiveTime,
    pub lookback_hours: u32,
    /// `None` falls back to `$DIGEST_FEEDS_PATH` / `config/feeds.{toml,json}`.
    pub feeds_path: Option<PathBuf>,
}

/// Time until the next occurrence of `at`, today if still ahead, else tomorrow.
pub fn delay_until_next(now: DateTime<Utc>, at: NaiveTime) -> Duration {
    let today = now.date_naive().and_time(at).and_utc();
    let next = if today > now {
        today
    } else {
        today
            .checked_add_days(Days::new(1))
            .unwrap_or(today)
    };
    (next - now).to_std().unwrap_or_default()
}

pub fn spawn_daily_digest(
    orchestrator: Arc<DigestProcessingOrchestrator>,
    cfg: DailyDigestCfg,
    mailer: Option<Arc<DigestMailer>>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = delay_until_next(Utc::now(), cfg.at);
            tracing::info!(
                target: "ingest",
                at = %cfg.at,
                in_secs = delay.as_secs(),
                "next scheduled digest"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) =
                run_scheduled_digest(&orchestrator, &cfg, mailer.as_deref(), &shutdown).await
            {
                tracing::warn!(target: "ingest", error = ?e, "scheduled digest failed");
                counter!("digest_scheduled_errors_total").increment(1);
            }
            gauge!("digest_scheduled_last_run_ts").set(Utc::now().timestamp() as f64);
        }
        tracing::info!(target: "ingest", "daily digest task stopped");
    })
}

fn load_feeds(cfg: &DailyDigestCfg) -> Result<Vec<FeedId>> {
    match &cfg.feeds_path {
        Some(p) => load_feeds_from(p),
        None => load_feeds_default(),
    }
}

/// Queue one digest for the last `lookback_hours`, wait for it, mail it on success.
pub async fn run_scheduled_digest(
    orchestrator: &DigestProcessingOrchestrator,
    cfg: &DailyDigestCfg,
    mailer: Option<&DigestMailer>,
    shutdown: &CancellationToken,
) -> Result<Option<DigestId>> {
    let feeds = load_feeds(cfg).context("loading feed list")?;
    if feeds.is_empty() {
        tracing::warn!(target: "ingest", "no feeds configured, scheduled digest skipped");
        return Ok(None);
    }

    let now = Utc::now();
    let from = now - chrono::Duration::hours(i64::from(cfg.lookback_hours));
    let filter = DigestFilter::new_at(from, now, feeds, Default::default(), now)?;
    let id = DigestId::new();
    orchestrator.queue_digest(id, filter, shutdown.child_token())?;
    tracing::info!(target: "ingest", digest_id = %id, "scheduled digest queued");

    let Some(terminal) = wait_for_terminal(orchestrator, id, shutdown).await else {
        return Ok(Some(id));
    };
    if terminal != StepKind::Success {
        tracing::info!(target: "ingest", digest_id = %id, step = terminal.name(), "scheduled digest finished without result");
        return Ok(Some(id));
    }

    if let Some(mailer) = mailer {
        match orchestrator.repository().load_digest(id).await {
            Ok(Some(digest)) => {
                if let Err(e) = mailer.send_digest(&digest).await {
                    tracing::warn!(target: "ingest", digest_id = %id, error = ?e, "digest email failed");
                }
            }
            Ok(None) => tracing::warn!(target: "ingest", digest_id = %id, "digest missing after success"),
            Err(e) => tracing::warn!(target: "ingest", digest_id = %id, error = %e, "loading digest for email failed"),
        }
    }
    Ok(Some(id))
}

async fn wait_for_terminal(
    orchestrator: &DigestProcessingOrchestrator,
    id: DigestId,
    shutdown: &CancellationToken,
) -> Option<StepKind> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = ticker.tick() => {}
        }
        if let Some(step) = orchestrator.step_log().last_step(id) {
            if step.kind.is_terminal() {
                return Some(step.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn delay_wraps_to_tomorrow_when_time_has_passed() {
        let at = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2025, 3, 1, 6, 30, 0).unwrap();
        assert_eq!(delay_until_next(before, at), Duration::from_secs(30 * 60));

        let after = Utc.with_ymd_and_hms(2025, 3, 1, 7, 30, 0).unwrap();
        assert_eq!(delay_until_next(after, at), Duration::from_secs(23 * 3600 + 30 * 60));

        let exactly = Utc.with_ymd_and_hms(2025, 3, 1, 7, 0, 0).unwrap();
        assert_eq!(delay_until_next(exactly, at), Duration::from_secs(24 * 3600));
    }
}
