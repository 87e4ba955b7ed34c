//! Durable work queues.
//!
//! This crate provides:
//! - The `WorkQueue` abstraction (enqueue, fetch, ack, stale claim, dead-letter)
//! - A Redis Streams backend with consumer groups and retry counting
//! - An in-process backend for local runs and tests
//! - `QueueConsumer`, which runs a handler with bounded concurrency

pub mod consumer;
pub mod error;
pub mod memory;
pub mod queue;
pub mod redis_queue;

pub use consumer::{ConsumerConfig, QueueConsumer, WorkHandler};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryWorkQueue;
pub use queue::{Delivery, FailureDisposition, QueueConfig, WorkQueue};
pub use redis_queue::RedisWorkQueue;
