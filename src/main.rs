//! Feed Digest Service: binary entrypoint.
//! Boots the Axum HTTP server, wiring the digest orchestrator, metrics and the
//! optional daily digest job.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;

use feed_digest::config::AppConfig;
use feed_digest::ingest::scheduler::{spawn_daily_digest, DailyDigestCfg};
use feed_digest::metrics::Metrics;
use feed_digest::notify::DigestMailer;
use feed_digest::{build_orchestrator, init_tracing, router, AppState};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load().context("loading configuration")?;
    let orchestrator = build_orchestrator(&cfg).await?;

    let metrics = match Metrics::install(cfg.max_concurrent_ai_tasks) {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics disabled");
            None
        }
    };

    if let Some(at) = cfg.schedule.digest_time_utc {
        let mailer = match cfg.email.as_ref().map(DigestMailer::from_settings).transpose() {
            Ok(m) => m.map(Arc::new),
            Err(e) => {
                tracing::warn!(error = ?e, "digest email disabled");
                None
            }
        };
        spawn_daily_digest(
            orchestrator.clone(),
            DailyDigestCfg {
                at,
                lookback_hours: cfg.schedule.lookback_hours,
                feeds_path: cfg.schedule.feeds_path.clone(),
            },
            mailer,
            CancellationToken::new(),
        );
    }

    let state = AppState {
        orchestrator,
        metrics,
    };
    Ok(router(state).into())
}
