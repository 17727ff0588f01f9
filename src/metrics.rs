use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder. Can succeed only once per process.
    pub fn install(max_concurrent_ai_tasks: usize) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();

        gauge!("digest_ai_slots_total").set(max_concurrent_ai_tasks as f64);

        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("digest_queued_total", "Digests admitted to the wait queue.");
        describe_counter!(
            "digest_completed_total",
            "Digest runs finished, by outcome (success, no_posts, error, cancelled)."
        );
        describe_counter!("digest_ai_calls_total", "AI calls issued, by stage.");
        describe_counter!("digest_feed_errors_total", "Feed download/parse failures.");
        describe_counter!("digest_scheduled_errors_total", "Scheduled digest runs that failed to queue or finish.");
        describe_gauge!("digest_ai_inflight", "AI slots currently held.");
        describe_gauge!("digest_ai_slots_total", "Configured AI slot budget.");
        describe_gauge!("scheduler_waiting", "Work items waiting for a worker.");
        describe_gauge!("scheduler_running", "Work items currently running.");
        describe_gauge!("digest_scheduled_last_run_ts", "Unix ts of the last scheduled digest.");
        describe_histogram!("digest_generation_ms", "Digest run time in milliseconds.");
        describe_histogram!("digest_feed_parse_ms", "Feed parse time in milliseconds.");
    });
}
