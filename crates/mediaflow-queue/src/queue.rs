//! Work queue abstraction.

use std::time::Duration;

use async_trait::async_trait;

use mediaflow_models::WorkItem;

use crate::error::QueueResult;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key prefix; streams live at `{prefix}:queue:{name}`
    pub prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Failed deliveries before an item is dead-lettered
    pub max_retries: u32,
    /// How long a GUID is remembered to reject duplicate enqueues
    pub dedup_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            prefix: "mediaflow".to_string(),
            consumer_group: "mediaflow:workers".to_string(),
            max_retries: 3,
            dedup_ttl: Duration::from_secs(3600),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.prefix),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            max_retries: std::env::var("QUEUE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            dedup_ttl: std::env::var("QUEUE_DEDUP_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.dedup_ttl),
        }
    }

    pub fn stream_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    pub fn dlq_key(&self, queue: &str) -> String {
        format!("{}:dlq:{}", self.prefix, queue)
    }
}

/// One delivered work item, identified by its broker-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub item: WorkItem,
}

/// What the queue did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Left for redelivery; `attempt` failures so far out of `max`.
    Retry { attempt: u32, max: u32 },
    /// Retry bound reached; moved to the dead-letter stream.
    DeadLettered,
}

/// Durable, named, at-least-once work queues.
///
/// No ordering is guaranteed between items of the same queue once several
/// consumers are involved.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Ready `queue` for consumption (e.g. create the consumer group).
    async fn prepare(&self, _queue: &str) -> QueueResult<()> {
        Ok(())
    }

    /// Append an item; returns once the broker accepted it.
    async fn enqueue(&self, queue: &str, item: &WorkItem) -> QueueResult<String>;

    /// Take up to `count` new items, waiting at most `block` for the first.
    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Mark a delivery done and forget it.
    async fn ack(&self, queue: &str, delivery: &Delivery) -> QueueResult<()>;

    /// Take over deliveries whose consumer went quiet for at least `min_idle`.
    async fn claim_stale(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Reset a running delivery's idle time so `claim_stale` leaves it alone.
    async fn touch(&self, queue: &str, consumer: &str, delivery: &Delivery) -> QueueResult<()>;

    /// Count a failed delivery and dead-letter it once the bound is reached.
    async fn record_failure(
        &self,
        queue: &str,
        delivery: &Delivery,
        error: &str,
    ) -> QueueResult<FailureDisposition>;

    /// Items currently in the queue (delivered or not).
    async fn len(&self, queue: &str) -> QueueResult<u64>;

    async fn dead_letter_len(&self, queue: &str) -> QueueResult<u64>;

    /// Drop a queue that will not be served again. Non-empty queues are kept.
    async fn retire(&self, _queue: &str) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_key("transcode"), "mediaflow:queue:transcode");
        assert_eq!(config.dlq_key("download"), "mediaflow:dlq:download");
    }
}
