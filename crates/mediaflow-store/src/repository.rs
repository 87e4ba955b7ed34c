//! Job persistence contract.

use async_trait::async_trait;
use tracing::{debug, warn};

use mediaflow_models::{EncodeData, Job, JobGuid, JobStatus, NewJob, StatusCount};

use crate::error::StoreResult;

/// Clamp a progress value into `0..=100`. NaN becomes 0.
pub fn clamp_progress(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// Persistence collaborator for jobs and their encode data.
///
/// Every call is individually atomic: a reader never observes a half-written
/// status, and progress/diagnostic writes touch only the satellite record so
/// they are safe alongside a concurrent status transition.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job record in `queued` status.
    async fn create_job(&self, job: NewJob) -> StoreResult<Job>;

    /// Persist the zeroed encode data record for `job`.
    async fn create_encode_data(&self, job: &Job) -> StoreResult<EncodeData>;

    /// Load a job with its encode data attached.
    async fn get_job_by_guid(&self, guid: &JobGuid) -> StoreResult<Option<Job>>;

    /// Single-field status write. Does not validate the transition.
    async fn update_status(&self, guid: &JobGuid, status: JobStatus) -> StoreResult<()>;

    /// Replace the diagnostic payload.
    async fn update_encode_data(&self, id: i64, data: &str) -> StoreResult<()>;

    async fn update_progress(&self, id: i64, percent: f64) -> StoreResult<()>;

    /// Jobs ordered newest first.
    async fn list_jobs(&self, offset: u32, limit: u32) -> StoreResult<Vec<Job>>;

    /// Count per status, one entry for every status in `JobStatus::ALL` order.
    async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>>;

    /// Create a job and its encode data; returns the job with both ids set.
    ///
    /// The two writes are separate. If the encode data write fails the job
    /// record is left in `error`, never in `queued`, and the write error is
    /// returned.
    async fn create(&self, new_job: NewJob) -> StoreResult<Job> {
        let mut job = self.create_job(new_job).await?;
        job.encode_data = match self.create_encode_data(&job).await {
            Ok(data) => data,
            Err(e) => {
                warn!(guid = %job.guid, "Failed to create encode data, marking job as error: {}", e);
                if let Err(mark_err) = self.update_status(&job.guid, JobStatus::Error).await {
                    warn!(guid = %job.guid, "Failed to mark job as error: {}", mark_err);
                }
                return Err(e);
            }
        };
        debug!(guid = %job.guid, id = job.id, encode_data_id = job.encode_data.id, "Job created");
        Ok(job)
    }

    async fn transition(&self, guid: &JobGuid, status: JobStatus) -> StoreResult<()> {
        debug!(guid = %guid, status = %status, "Job status transition");
        self.update_status(guid, status).await
    }

    async fn record_progress(&self, encode_data_id: i64, percent: f64) -> StoreResult<()> {
        self.update_progress(encode_data_id, clamp_progress(percent))
            .await
    }

    async fn record_diagnostics(&self, encode_data_id: i64, payload: &str) -> StoreResult<()> {
        self.update_encode_data(encode_data_id, payload).await
    }
}
