//! Queue payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};
use crate::job::{Job, JobAction, JobGuid};

/// Minimal dispatch signal placed on a work queue.
///
/// Carries just enough to find the job record again; the record in the
/// store stays the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub guid: JobGuid,
    pub profile: String,
    pub source: String,
    pub destination: String,
    pub c24_job_id: String,
    pub action: JobAction,
}

impl WorkItem {
    pub fn from_job(job: &Job) -> Self {
        Self {
            guid: job.guid.clone(),
            profile: job.profile.clone(),
            source: job.source.clone(),
            destination: job.destination.clone(),
            c24_job_id: job.c24_job_id.clone(),
            action: job.action,
        }
    }

    /// Flatten into string key/value pairs.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("guid", self.guid.to_string()),
            ("profile", self.profile.clone()),
            ("source", self.source.clone()),
            ("destination", self.destination.clone()),
            ("c24_job_id", self.c24_job_id.clone()),
            ("action", self.action.as_str().to_string()),
        ]
    }

    /// Rebuild from a string-keyed argument map.
    pub fn from_fields(fields: &HashMap<String, String>) -> ModelResult<Self> {
        let get = |key: &'static str| {
            fields
                .get(key)
                .cloned()
                .ok_or(ModelError::MissingField(key))
        };

        Ok(Self {
            guid: JobGuid::from_string(get("guid")?),
            profile: get("profile")?,
            source: get("source")?,
            destination: get("destination")?,
            c24_job_id: get("c24_job_id")?,
            action: get("action")?.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkItem {
        WorkItem {
            guid: JobGuid::from_string("guid-1"),
            profile: "720p".to_string(),
            source: "gs://in/a.mov".to_string(),
            destination: "gs://out/a.mp4".to_string(),
            c24_job_id: "abc".to_string(),
            action: JobAction::Transcode,
        }
    }

    #[test]
    fn test_fields_contain_every_key() {
        let fields: HashMap<String, String> = sample()
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields.len(), 6);
        assert_eq!(fields["action"], "transcode");
        assert_eq!(WorkItem::from_fields(&fields).unwrap(), sample());
    }

    #[test]
    fn test_missing_field_is_reported() {
        let mut fields: HashMap<String, String> = sample()
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.remove("c24_job_id");
        assert_eq!(
            WorkItem::from_fields(&fields),
            Err(ModelError::MissingField("c24_job_id"))
        );
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let mut fields: HashMap<String, String> = sample()
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        fields.insert("action".to_string(), "resize".to_string());
        assert!(matches!(
            WorkItem::from_fields(&fields),
            Err(ModelError::UnknownAction(_))
        ));
    }
}
