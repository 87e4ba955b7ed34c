//! Inbound ingest requests.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::job::{JobAction, NewJob};

/// Action request as delivered by the event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub c24_job_id: String,
    pub profile: String,
    pub source: String,
    pub dest: String,
    /// Raw action string; parsed during validation
    #[serde(default)]
    pub action: String,
}

impl IngestRequest {
    /// Validate the request and resolve its action.
    pub fn validate(&self) -> ModelResult<JobAction> {
        if self.c24_job_id.trim().is_empty() {
            return Err(ModelError::invalid_request("c24_job_id is required"));
        }

        if self.profile.trim().is_empty() {
            return Err(ModelError::invalid_request("profile is required"));
        }

        if self.source.trim().is_empty() {
            return Err(ModelError::invalid_request("source is required"));
        }

        if self.dest.trim().is_empty() {
            return Err(ModelError::invalid_request("dest is required"));
        }

        self.action.parse()
    }

    /// Build the job spec for a validated request.
    pub fn to_new_job(&self, action: JobAction) -> NewJob {
        NewJob::new(
            self.c24_job_id.trim(),
            self.profile.trim(),
            action,
            self.source.trim(),
            self.dest.trim(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: &str) -> IngestRequest {
        IngestRequest {
            c24_job_id: "abc".to_string(),
            profile: "720p".to_string(),
            source: "gs://in/a.mov".to_string(),
            dest: "gs://out/a.mp4".to_string(),
            action: action.to_string(),
        }
    }

    #[test]
    fn test_deserialize_wire_format() {
        let raw = r#"{"c24_job_id":"abc","profile":"720p","source":"gs://in/a.mov","dest":"gs://out/a.mp4","action":"transcode"}"#;
        let parsed: IngestRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed, request("transcode"));
    }

    #[test]
    fn test_validate_resolves_action() {
        assert_eq!(request("download").validate().unwrap(), JobAction::Download);
        assert_eq!(request("snippetize").validate().unwrap(), JobAction::Snippetize);
        assert!(matches!(
            request("").validate(),
            Err(ModelError::UnknownAction(_))
        ));
    }

    #[test]
    fn test_validate_requires_fields() {
        let mut req = request("transcode");
        req.profile = "  ".to_string();
        assert!(matches!(req.validate(), Err(ModelError::InvalidRequest(_))));
    }

    #[test]
    fn test_to_new_job_copies_fields() {
        let job = request("transcode").to_new_job(JobAction::Transcode);
        assert_eq!(job.c24_job_id, "abc");
        assert_eq!(job.destination, "gs://out/a.mp4");
        assert_eq!(job.action, JobAction::Transcode);
    }
}
