//! Dedicated worker jobs for compute-heavy stages.
//!
//! This crate provides:
//! - A serde model of the `batch/v1` Job resource
//! - A typed option builder over a fixed base template
//! - In-cluster submission authenticated with the pod service account

pub mod builder;
pub mod client;
pub mod error;
pub mod provisioner;
pub mod spec;

pub use builder::{base_job, build_job, JobOption, ResourceTier};
pub use client::{ClusterClient, InClusterClient};
pub use error::{ProvisionError, ProvisionResult};
pub use provisioner::{ProvisionedJob, Provisioner, ProvisionerConfig};
pub use spec::BatchJob;
