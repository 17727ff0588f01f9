//! One-shot digest: runs a digest synchronously over the configured (or given) feeds
//! and prints the outcome as JSON.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use feed_digest::config::AppConfig;
use feed_digest::digest::{DigestFilter, DigestId, FeedId};
use feed_digest::ingest::config::{load_feeds_default, load_feeds_from};
use feed_digest::{build_orchestrator, init_tracing};

#[derive(Debug, Parser)]
#[command(name = "digest-once", about = "Generate one feed digest and print it", version)]
struct Cli {
    /// Window length, ending now.
    #[arg(long, default_value_t = 24)]
    hours: u32,

    /// Feed URL; repeatable. Defaults to the configured feed list.
    #[arg(long = "feed")]
    feeds: Vec<String>,

    /// Feed list file (TOML `feeds = [..]` or JSON array).
    #[arg(long)]
    feeds_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let cfg = AppConfig::load().context("loading configuration")?;
    let feeds = if !cli.feeds.is_empty() {
        cli.feeds
            .iter()
            .map(|f| FeedId::parse(f))
            .collect::<Result<Vec<_>, _>>()?
    } else if let Some(p) = &cli.feeds_file {
        load_feeds_from(p)?
    } else {
        load_feeds_default()?
    };
    if cli.hours == 0 {
        bail!("--hours must be at least 1");
    }

    let now = Utc::now();
    let filter = DigestFilter::new_at(
        now - Duration::hours(i64::from(cli.hours)),
        now,
        feeds,
        Default::default(),
        now,
    )?;

    let orchestrator = build_orchestrator(&cfg).await?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let id = DigestId::new();
    let outcome = orchestrator.process_digest(id, &filter, &cancel).await;
    orchestrator.shutdown().await;

    let outcome = outcome.with_context(|| format!("digest {id} failed"))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
