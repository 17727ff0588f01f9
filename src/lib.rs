// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod analyze;
pub mod api;
pub mod config;
pub mod digest;
pub mod ingest;
pub mod metrics;
pub mod notify;
pub mod scheduler;
pub mod steps;

// ---- Re-exports for stable public API ----
pub use crate::analyze::ai_adapter;
pub use crate::api::{router, AppState};
pub use crate::digest::{DigestId, DigestProcessingOrchestrator};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;
use crate::digest::{
    AiSlots, DigestRepository, DigestScope, JsonFileDigestRepository, SharedScopeFactory,
};
use crate::ingest::{FeedClient, RssFeedClient};
use crate::steps::StepLog;

const FEED_TIMEOUT: Duration = Duration::from_secs(30);

/// Install the global tracing subscriber. `RUST_LOG` wins over the default filter;
/// `DIGEST_LOG_JSON=1` switches to JSON lines. A subscriber that is already set is kept.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feed_digest=info,warn"));
    let json = std::env::var("DIGEST_LOG_JSON").is_ok_and(|v| v == "1");

    let res = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Wire the production collaborators (RSS over HTTP, configured AI client, JSON file
/// storage) behind one orchestrator. Must run inside a Tokio runtime.
pub async fn build_orchestrator(cfg: &AppConfig) -> anyhow::Result<Arc<DigestProcessingOrchestrator>> {
    let feeds: Arc<dyn FeedClient> =
        Arc::new(RssFeedClient::new(FEED_TIMEOUT).context("building feed http client")?);
    let ai = analyze::build_ai_client(&cfg.ai).context("building AI client")?;
    let repository: Arc<dyn DigestRepository> = Arc::new(
        JsonFileDigestRepository::open(&cfg.storage_dir)
            .await
            .with_context(|| format!("opening digest storage {}", cfg.storage_dir.display()))?,
    );

    tracing::info!(
        ai_provider = ai.provider_name(),
        max_concurrent_ai_tasks = cfg.max_concurrent_ai_tasks,
        storage = %cfg.storage_dir.display(),
        "digest service configured"
    );

    let scopes = Arc::new(SharedScopeFactory::new(DigestScope {
        feeds,
        ai,
        repository,
    }));
    Ok(Arc::new(DigestProcessingOrchestrator::new(
        scopes,
        Arc::new(StepLog::new()),
        AiSlots::new(cfg.max_concurrent_ai_tasks),
        cfg.prompts.clone(),
    )))
}
