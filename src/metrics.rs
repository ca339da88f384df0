//! Engine metrics.
//!
//! Thin helpers over the `metrics` facade so call sites stay one line and
//! metric names live in one place. Without an installed recorder every call
//! is a no-op, which is what tests and `pinnerd check` get.

use anyhow::{Context, Result};
use metrics::{Unit, describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

const REQUESTS_TOTAL: &str = "pinnerd_requests_total";
const DROPPED_TOTAL: &str = "pinnerd_messages_dropped_total";
const IN_FLIGHT: &str = "pinnerd_in_flight";
const WEBHOOKS_TOTAL: &str = "pinnerd_webhooks_total";

/// Installs the Prometheus exporter on `listen` and describes every metric.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn install(listen: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tracing::info!(%listen, "Prometheus metrics listening (path: /metrics)");
    describe();
    Ok(())
}

fn describe() {
    describe_counter!(
        REQUESTS_TOTAL,
        Unit::Count,
        "Pin and unpin requests processed, by operation and outcome."
    );
    describe_counter!(
        DROPPED_TOTAL,
        Unit::Count,
        "Queue messages dropped because they could not be decoded."
    );
    describe_gauge!(
        IN_FLIGHT,
        Unit::Count,
        "Work items currently holding a concurrency slot, by limiter."
    );
    describe_counter!(
        WEBHOOKS_TOTAL,
        Unit::Count,
        "Webhook notifications handled, by outcome."
    );
}

/// Records the outcome of one pin or unpin request.
pub fn record_request(operation: &'static str, outcome: &'static str) {
    metrics::counter!(REQUESTS_TOTAL, "op" => operation, "outcome" => outcome).increment(1);
}

/// Records a message dropped by an intake loop.
pub fn record_dropped(topic: &str) {
    metrics::counter!(DROPPED_TOTAL, "topic" => topic.to_string()).increment(1);
}

/// Publishes the number of slots in use for a limiter.
pub fn set_in_flight(limiter: &str, in_use: usize) {
    metrics::gauge!(IN_FLIGHT, "limiter" => limiter.to_string()).set(in_use as f64);
}

/// Records the outcome of one webhook notification.
pub fn record_webhook(outcome: &'static str) {
    metrics::counter!(WEBHOOKS_TOTAL, "outcome" => outcome).increment(1);
}
