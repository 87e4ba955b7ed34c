//! Prometheus metrics for the dispatcher.

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::{DispatchError, DispatchResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const MESSAGES_PULLED_TOTAL: &str = "mediaflow_pubsub_messages_pulled_total";
    pub const MESSAGES_ACKED_TOTAL: &str = "mediaflow_pubsub_messages_acked_total";
    pub const REQUESTS_ROUTED_TOTAL: &str = "mediaflow_requests_routed_total";
    pub const JOBS_ENQUEUED_TOTAL: &str = "mediaflow_jobs_enqueued_total";
}

/// Install the Prometheus exporter on `0.0.0.0:port`. Port 0 disables it.
pub fn init_exporter(port: u16) -> DispatchResult<()> {
    if port == 0 {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| DispatchError::config_error(format!("metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

pub fn record_pulled(count: usize) {
    counter!(names::MESSAGES_PULLED_TOTAL).increment(count as u64);
}

pub fn record_acked(count: usize) {
    counter!(names::MESSAGES_ACKED_TOTAL).increment(count as u64);
}

/// Outcome of routing one request: `routed`, `rejected` or `retry`.
pub fn record_routed(outcome: &'static str) {
    counter!(names::REQUESTS_ROUTED_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_enqueued(queue: &str) {
    counter!(names::JOBS_ENQUEUED_TOTAL, "queue" => queue.to_string()).increment(1);
}
