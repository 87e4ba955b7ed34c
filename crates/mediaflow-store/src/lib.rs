//! Job persistence.
//!
//! This crate provides:
//! - The `JobStore` trait: job records, status transitions, encode data
//! - A Firestore REST backend with service account auth via gcp_auth
//! - An in-memory backend for local runs and tests
//! - Token caching, retry with backoff, and request metrics

pub mod backend;
pub mod client;
pub mod error;
pub mod firestore_store;
pub mod memory;
pub mod metrics;
pub mod repository;
pub mod retry;
pub mod token_cache;
pub mod types;


pub use backend::StoreBackend;
pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{StoreError, StoreResult};
pub use firestore_store::FirestoreJobStore;
pub use memory::MemoryJobStore;
pub use repository::{clamp_progress, JobStore};
pub use retry::RetryConfig;
pub use token_cache::{TokenCache, FIRESTORE_SCOPE};
pub use types::{Document, FromFirestoreValue, ToFirestoreValue, Value};
