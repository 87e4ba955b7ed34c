//! Work queues on Redis Streams.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use mediaflow_models::WorkItem;

use crate::error::{QueueError, QueueResult};
use crate::queue::{Delivery, FailureDisposition, QueueConfig, WorkQueue};

/// Redis Streams queue client.
///
/// Each logical queue is one stream read through a shared consumer group.
/// Work item fields are stored flat in the stream entry.
pub struct RedisWorkQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl RedisWorkQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn dedup_key(&self, queue: &str, item: &WorkItem) -> String {
        format!("{}:dedup:{}:{}", self.config.prefix, queue, item.guid)
    }

    fn retry_key(&self, queue: &str, message_id: &str) -> String {
        format!("{}:retry:{}:{}", self.config.prefix, queue, message_id)
    }

    /// Decode entries, acking any that cannot be decoded so they are not
    /// redelivered forever.
    async fn decode_entries(&self, queue: &str, entries: Vec<StreamId>) -> Vec<Delivery> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_entry(&entry.id, &entry.map) {
                Ok(delivery) => deliveries.push(delivery),
                Err(e) => {
                    warn!(queue = %queue, "{}", e);
                    if let Err(ack_err) = self.remove(queue, &entry.id).await {
                        warn!(queue = %queue, message_id = %entry.id, "Failed to drop malformed entry: {}", ack_err);
                    }
                }
            }
        }
        deliveries
    }

    async fn remove(&self, queue: &str, message_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let stream = self.config.stream_key(queue);

        redis::cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&stream)
            .arg(message_id)
            .query_async::<()>(&mut conn)
            .await?;

        conn.del::<_, ()>(self.retry_key(queue, message_id)).await?;
        Ok(())
    }
}

fn parse_entry(id: &str, map: &HashMap<String, redis::Value>) -> QueueResult<Delivery> {
    let fields: HashMap<String, String> = map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();

    let item = WorkItem::from_fields(&fields).map_err(|e| QueueError::Malformed {
        id: id.to_string(),
        reason: e.to_string(),
    })?;

    Ok(Delivery {
        message_id: id.to_string(),
        item,
    })
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn prepare(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let stream = self.config.stream_key(queue);

        // Start at 0 so items enqueued before the first worker are delivered
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group {} on {}", self.config.consumer_group, stream),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists on {}", stream);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn enqueue(&self, queue: &str, item: &WorkItem) -> QueueResult<String> {
        let mut conn = self.connection().await?;

        let dedup_key = self.dedup_key(queue, item);
        let fresh: bool = redis::cmd("SET")
            .arg(&dedup_key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(self.config.dedup_ttl.as_secs().max(1))
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if !fresh {
            warn!(queue = %queue, guid = %item.guid, "Duplicate work item rejected");
            return Err(QueueError::Duplicate(item.guid.to_string()));
        }

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.config.stream_key(queue)).arg("*");
        for (key, value) in item.to_fields() {
            cmd.arg(key).arg(value);
        }

        let message_id: String = match cmd.query_async(&mut conn).await {
            Ok(id) => id,
            Err(e) => {
                // Let a later attempt for the same GUID through
                conn.del::<_, ()>(&dedup_key).await.ok();
                return Err(QueueError::enqueue_failed(e.to_string()));
            }
        };

        info!(queue = %queue, guid = %item.guid, message_id = %message_id, "Enqueued work item");
        Ok(message_id)
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(self.config.stream_key(queue))
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let entries: Vec<StreamId> = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();

        if !entries.is_empty() {
            debug!(queue = %queue, count = entries.len(), "Fetched work items");
        }
        Ok(self.decode_entries(queue, entries).await)
    }

    async fn ack(&self, queue: &str, delivery: &Delivery) -> QueueResult<()> {
        self.remove(queue, &delivery.message_id).await?;

        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.dedup_key(queue, &delivery.item))
            .await?;

        debug!(queue = %queue, message_id = %delivery.message_id, "Acknowledged work item");
        Ok(())
    }

    async fn claim_stale(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;
        let stream = self.config.stream_key(queue);
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;

        let stale: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms as u64 >= min_idle_ms)
            .map(|p| p.id)
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks idle time, so a racing consumer cannot double-claim
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&stale)
            .query_async(&mut conn)
            .await?;

        if !claimed.ids.is_empty() {
            info!(queue = %queue, count = claimed.ids.len(), "Claimed stale work items");
        }
        Ok(self.decode_entries(queue, claimed.ids).await)
    }

    async fn touch(&self, queue: &str, consumer: &str, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        // Zero min-idle always succeeds for a pending id; JUSTID leaves the
        // delivery counter alone
        redis::cmd("XCLAIM")
            .arg(self.config.stream_key(queue))
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(0)
            .arg(&delivery.message_id)
            .arg("JUSTID")
            .query_async::<Vec<String>>(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        queue: &str,
        delivery: &Delivery,
        error: &str,
    ) -> QueueResult<FailureDisposition> {
        let mut conn = self.connection().await?;

        let retry_key = self.retry_key(queue, &delivery.message_id);
        let attempt: u32 = conn.incr(&retry_key, 1).await?;
        conn.expire::<_, ()>(&retry_key, 86400).await?;

        if attempt < self.config.max_retries {
            return Ok(FailureDisposition::Retry {
                attempt,
                max: self.config.max_retries,
            });
        }

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.config.dlq_key(queue)).arg("*");
        for (key, value) in delivery.item.to_fields() {
            cmd.arg(key).arg(value);
        }
        cmd.arg("error")
            .arg(error)
            .arg("original_id")
            .arg(&delivery.message_id)
            .arg("attempts")
            .arg(attempt);
        cmd.query_async::<String>(&mut conn).await?;

        self.ack(queue, delivery).await?;

        warn!(
            queue = %queue,
            guid = %delivery.item.guid,
            attempts = attempt,
            "Moved work item to dead-letter stream: {}",
            error
        );
        Ok(FailureDisposition::DeadLettered)
    }

    async fn len(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        Ok(conn.xlen(self.config.stream_key(queue)).await?)
    }

    async fn dead_letter_len(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        Ok(conn.xlen(self.config.dlq_key(queue)).await?)
    }

    async fn retire(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let stream = self.config.stream_key(queue);

        let remaining: u64 = conn.xlen(&stream).await?;
        if remaining > 0 {
            warn!(queue = %queue, remaining, "Not retiring queue with items left");
            return Ok(());
        }

        // Takes the consumer group with it
        conn.del::<_, ()>(&stream).await?;
        debug!(queue = %queue, "Retired queue");
        Ok(())
    }
}
