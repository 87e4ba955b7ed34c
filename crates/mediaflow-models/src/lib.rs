//! Shared data models for the MediaFlow dispatcher.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs, their status state machine and encode data
//! - Queue work items
//! - Inbound ingest requests
//! - Encode profiles

pub mod error;
pub mod job;
pub mod profile;
pub mod request;
pub mod work_item;

// Re-export common types
pub use error::{ModelError, ModelResult};
pub use job::{EncodeData, Job, JobAction, JobGuid, JobStatus, NewJob, StatusCount};
pub use profile::{EncodeProfile, ProfileCatalog};
pub use request::IngestRequest;
pub use work_item::WorkItem;
