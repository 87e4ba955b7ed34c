//! Prometheus metrics for the worker.

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::{WorkerError, WorkerResult};
use crate::stage::Stage;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "mediaflow_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "mediaflow_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "mediaflow_jobs_failed_total";
    pub const STAGE_DURATION_SECONDS: &str = "mediaflow_stage_duration_seconds";
    pub const PROGRESS_SAMPLES_TOTAL: &str = "mediaflow_progress_samples_total";
    pub const NOTIFICATIONS_TOTAL: &str = "mediaflow_notifications_total";
}

/// Install the Prometheus exporter on `0.0.0.0:port`. Port 0 disables it.
pub fn init_exporter(port: u16) -> WorkerResult<()> {
    if port == 0 {
        return Ok(());
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

pub fn record_job_started(action: &str) {
    counter!(names::JOBS_STARTED_TOTAL, "action" => action.to_string()).increment(1);
}

pub fn record_job_completed(action: &str) {
    counter!(names::JOBS_COMPLETED_TOTAL, "action" => action.to_string()).increment(1);
}

pub fn record_job_failed(action: &str, stage: Option<Stage>) {
    let stage = stage.map(|s| s.as_str()).unwrap_or("setup");
    counter!(
        names::JOBS_FAILED_TOTAL,
        "action" => action.to_string(),
        "stage" => stage
    )
    .increment(1);
}

pub fn record_stage_duration(stage: Stage, elapsed: Duration, success: bool) {
    histogram!(
        names::STAGE_DURATION_SECONDS,
        "stage" => stage.as_str(),
        "outcome" => if success { "success" } else { "failure" }
    )
    .record(elapsed.as_secs_f64());
}

pub fn record_progress_sample(stage: Stage, written: bool) {
    counter!(
        names::PROGRESS_SAMPLES_TOTAL,
        "stage" => stage.as_str(),
        "written" => if written { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_notification(success: bool) {
    counter!(
        names::NOTIFICATIONS_TOTAL,
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}
