//! Object storage transfers.
//!
//! This crate provides:
//! - Locator parsing for `s3://`, `gs://` and local paths
//! - The `StorageTransfer` collaborator trait
//! - An S3 SDK client that also serves GCS through its interoperability endpoint

pub mod client;
pub mod error;
pub mod location;
pub mod transfer;

pub use client::{ObjectStoreClient, StorageConfig, GCS_ENDPOINT};
pub use error::{StorageError, StorageResult};
pub use location::StorageLocation;
pub use transfer::StorageTransfer;
