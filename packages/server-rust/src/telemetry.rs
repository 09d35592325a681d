//! Process-wide logging and metrics setup.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,apiflow_server=info,tower_http=warn";

const DURATION_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Installs the global tracing subscriber: JSON lines for log shippers, or
/// human-readable output for terminals.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()?;
    }
    Ok(())
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Fails if a recorder is already installed or the listener cannot bind.
pub fn install_metrics_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_ms".to_string()), DURATION_BUCKETS_MS)?
        .install()?;
    describe_metrics();
    tracing::info!(%addr, "metrics exporter listening");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!("apiflow_requests_total", "Requests by method and status");
    metrics::describe_histogram!(
        "apiflow_request_duration_ms",
        metrics::Unit::Milliseconds,
        "End-to-end request latency"
    );
    metrics::describe_counter!("apiflow_requests_shed_total", "Requests rejected by load shedding");
    metrics::describe_counter!("apiflow_cache_hits_total", "Replies served from the dedup cache");
    metrics::describe_counter!(
        "apiflow_fatal_failures_total",
        "Infrastructure failures that took the fatal path"
    );
}
