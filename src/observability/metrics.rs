//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_requests_total` (counter): finished contexts by engine, status, outcome
//! - `relay_request_duration_seconds` (histogram): context lifetime
//! - `relay_active_contexts` (gauge): contexts currently alive
//!
//! # Design Decisions
//! - Exposition is optional and served on its own listener
//! - Labels are bounded: engine names come from config, outcomes are fixed

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record one finished request context.
pub fn record_request(engine: &str, status: u16, outcome: &'static str, start: Instant) {
    metrics::counter!(
        "relay_requests_total",
        "engine" => engine.to_string(),
        "status" => status.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "engine" => engine.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Publish the number of live request contexts.
pub fn record_active_contexts(count: u64) {
    metrics::gauge!("relay_active_contexts").set(count as f64);
}
