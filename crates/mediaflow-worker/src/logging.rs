//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for job processing with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};

use mediaflow_models::JobGuid;

/// Job logger for structured logging with consistent formatting.
///
/// Every event carries the job GUID, the external job id and the operation
/// (the action or stage being run).
#[derive(Debug, Clone)]
pub struct JobLogger {
    guid: String,
    c24_job_id: String,
    operation: String,
}

impl JobLogger {
    pub fn new(guid: &JobGuid, c24_job_id: &str, operation: &str) -> Self {
        Self {
            guid: guid.to_string(),
            c24_job_id: c24_job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Same job, different operation.
    pub fn for_operation(&self, operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            ..self.clone()
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            guid = %self.guid,
            job_id = %self.c24_job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            guid = %self.guid,
            job_id = %self.c24_job_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            guid = %self.guid,
            job_id = %self.c24_job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            guid = %self.guid,
            job_id = %self.c24_job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            guid = %self.guid,
            job_id = %self.c24_job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            guid = %self.guid,
            job_id = %self.c24_job_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_creation() {
        let guid = JobGuid::new();
        let logger = JobLogger::new(&guid, "abc", "transcode");

        assert_eq!(logger.guid(), guid.to_string());
        assert_eq!(logger.operation(), "transcode");
    }

    #[test]
    fn test_for_operation_keeps_job() {
        let guid = JobGuid::from_string("g-1");
        let logger = JobLogger::new(&guid, "abc", "transcode").for_operation("encode");

        assert_eq!(logger.guid(), "g-1");
        assert_eq!(logger.operation(), "encode");
    }
}
