//! Request dispatcher.
//!
//! This crate provides:
//! - The ingestion router: validate, persist, enqueue, provision
//! - A Pub/Sub pull ingress with ack-on-success semantics
//! - Dispatcher configuration and metrics

pub mod config;
pub mod error;
pub mod ingress;
pub mod metrics;
pub mod pubsub;
pub mod router;

pub use config::{DispatcherConfig, PubSubConfig};
pub use error::{DispatchError, DispatchResult};
pub use ingress::Ingress;
pub use pubsub::{PubSubClient, PubsubMessage, ReceivedMessage, PUBSUB_SCOPE};
pub use router::IngestionRouter;
