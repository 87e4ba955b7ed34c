//! Worker error types.

use thiserror::Error;

use crate::stage::Stage;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Unknown encode profile: {0}")]
    ProfileNotFound(String),

    #[error("Action not supported by this worker: {0}")]
    UnsupportedAction(String),

    #[error("{stage} stage failed: {message}")]
    StageFailed { stage: Stage, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Notification failed: {0}")]
    NotifyFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] mediaflow_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] mediaflow_queue::QueueError),

    #[error("Media error: {0}")]
    Media(#[from] mediaflow_media::MediaError),

    #[error("Storage error: {0}")]
    Storage(#[from] mediaflow_storage::StorageError),

    #[error("Model error: {0}")]
    Model(#[from] mediaflow_models::ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn stage_failed(stage: Stage, msg: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            message: msg.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn notify_failed(msg: impl Into<String>) -> Self {
        Self::NotifyFailed(msg.into())
    }

    /// Failures the job record can absorb: the job is marked `error` and the
    /// work item is acknowledged.
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            WorkerError::StageFailed { .. }
                | WorkerError::ProfileNotFound(_)
                | WorkerError::UnsupportedAction(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(WorkerError::stage_failed(Stage::Encode, "exit 1").is_job_failure());
        assert!(WorkerError::ProfileNotFound("4k".into()).is_job_failure());
        assert!(!WorkerError::JobNotFound("g".into()).is_job_failure());
        assert!(!WorkerError::Store(mediaflow_store::StoreError::ServerError(503, "x".into()))
            .is_job_failure());
    }

    #[test]
    fn test_stage_message() {
        let err = WorkerError::stage_failed(Stage::Download, "destination unreachable");
        assert_eq!(err.to_string(), "download stage failed: destination unreachable");
    }
}
