//! Job record, status state machine and encode data.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

/// Externally visible job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobGuid(pub String);

impl JobGuid {
    /// Generate a new random GUID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobGuid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested kind of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Fetch a source asset into local or remote storage
    Download,
    /// Probe, encode and upload a staged source
    Transcode,
    /// Clip extraction; accepted by the model but not yet executed anywhere
    Snippetize,
}

impl JobAction {
    pub const ALL: [JobAction; 3] = [JobAction::Download, JobAction::Transcode, JobAction::Snippetize];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Download => "download",
            JobAction::Transcode => "transcode",
            JobAction::Snippetize => "snippetize",
        }
    }

    /// Name of the work queue serving this action.
    pub fn queue_name(&self) -> Option<&'static str> {
        match self {
            JobAction::Download => Some("download"),
            JobAction::Transcode => Some("transcode"),
            JobAction::Snippetize => None,
        }
    }

    /// Worker role argument for a dedicated compute job.
    pub fn worker_role(&self) -> Option<&'static str> {
        match self {
            JobAction::Download => Some("downloader"),
            JobAction::Transcode => Some("transcoder"),
            JobAction::Snippetize => None,
        }
    }

    /// Queue served only by the worker provisioned for `job_id`.
    pub fn dedicated_queue_name(&self, job_id: &str) -> Option<String> {
        self.queue_name().map(|queue| format!("{}:{}", queue, job_id))
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "download" => Ok(JobAction::Download),
            "transcode" => Ok(JobAction::Transcode),
            "snippetize" => Ok(JobAction::Snippetize),
            other => Err(ModelError::UnknownAction(other.to_string())),
        }
    }
}

/// Job status, declared in temporal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Downloading,
    Downloaded,
    Probing,
    Encoding,
    Uploading,
    Completed,
    Error,
}

impl JobStatus {
    /// All statuses in temporal order, `Error` last.
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Queued,
        JobStatus::Downloading,
        JobStatus::Downloaded,
        JobStatus::Probing,
        JobStatus::Encoding,
        JobStatus::Uploading,
        JobStatus::Completed,
        JobStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Downloaded => "downloaded",
            JobStatus::Probing => "probing",
            JobStatus::Encoding => "encoding",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    /// Position in the forward stage order. `Error` has no rank.
    pub fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Queued => Some(0),
            JobStatus::Downloading => Some(1),
            JobStatus::Downloaded => Some(2),
            JobStatus::Probing => Some(3),
            JobStatus::Encoding => Some(4),
            JobStatus::Uploading => Some(5),
            JobStatus::Completed => Some(6),
            JobStatus::Error => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Forward moves are legal, as is `Error` from any non-terminal status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownStatus(s.to_string()))
    }
}

/// Transient execution state attached one-to-one to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeData {
    /// Numeric id assigned by the store
    pub id: i64,
    /// Owning job's numeric id
    pub job_id: i64,
    /// Progress of the current stage, 0-100
    pub progress: f64,
    /// Serialized diagnostic payload (e.g. the probe report)
    pub data: String,
}

impl EncodeData {
    /// Zeroed encode data for a freshly created job.
    pub fn empty(id: i64, job_id: i64) -> Self {
        Self {
            id,
            job_id,
            progress: 0.0,
            data: "{}".to_string(),
        }
    }
}

/// A unit of requested work, tracked end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Numeric id assigned by the store
    pub id: i64,
    /// Immutable external identifier
    pub guid: JobGuid,
    /// Identifier of the job in the requesting system
    pub c24_job_id: String,
    /// Encode profile name
    pub profile: String,
    pub action: JobAction,
    /// Source locator (URI or local path)
    pub source: String,
    /// Destination locator (URI, local path, or `local`)
    pub destination: String,
    pub status: JobStatus,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub callback: HashMap<String, serde_json::Value>,
    pub encode_data: EncodeData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attributes needed to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub guid: JobGuid,
    pub c24_job_id: String,
    pub profile: String,
    pub action: JobAction,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub callback: HashMap<String, serde_json::Value>,
}

impl NewJob {
    /// New job spec with a fresh GUID.
    pub fn new(
        c24_job_id: impl Into<String>,
        profile: impl Into<String>,
        action: JobAction,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            guid: JobGuid::new(),
            c24_job_id: c24_job_id.into(),
            profile: profile.into(),
            action,
            source: source.into(),
            destination: destination.into(),
            metadata: HashMap::new(),
            callback: HashMap::new(),
        }
    }

    /// Materialize into a queued job with store-assigned ids.
    pub fn into_job(self, id: i64, encode_data_id: i64, now: DateTime<Utc>) -> Job {
        Job {
            id,
            guid: self.guid,
            c24_job_id: self.c24_job_id,
            profile: self.profile,
            action: self.action,
            source: self.source,
            destination: self.destination,
            status: JobStatus::Queued,
            metadata: self.metadata,
            callback: self.callback,
            encode_data: EncodeData::empty(encode_data_id, id),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Job count for one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: JobStatus,
    pub count: u64,
}
