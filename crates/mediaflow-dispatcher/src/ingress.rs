//! Pub/Sub ingress loop.
//!
//! Pulls request batches, routes them with bounded concurrency and
//! acknowledges every message that was routed or can never be routed.
//! Messages that failed for a transient reason stay unacknowledged and are
//! redelivered once their ack deadline expires.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::DispatchResult;
use crate::metrics;
use crate::pubsub::{PubSubClient, ReceivedMessage};
use crate::router::IngestionRouter;

pub struct Ingress {
    client: PubSubClient,
    router: Arc<IngestionRouter>,
    concurrency: usize,
    idle_backoff: Duration,
    shutdown: watch::Sender<bool>,
}

impl Ingress {
    pub fn new(
        client: PubSubClient,
        router: Arc<IngestionRouter>,
        concurrency: usize,
        idle_backoff: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            router,
            concurrency: concurrency.max(1),
            idle_backoff,
            shutdown,
        }
    }

    /// Stop pulling. A batch already pulled is still routed and acknowledged.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Pull and route until shutdown.
    pub async fn run(&self) {
        info!(
            subscription = %self.client.config().subscription_path(),
            concurrency = self.concurrency,
            "Ingress started"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let pulled = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => continue,
                pulled = self.client.pull() => pulled,
            };

            let messages = match pulled {
                Ok(messages) => messages,
                Err(e) => {
                    error!("Pull failed: {}", e);
                    tokio::time::sleep(self.idle_backoff).await;
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::time::sleep(self.idle_backoff).await;
                continue;
            }

            if let Err(e) = self.process_batch(messages).await {
                error!("Acknowledge failed: {}", e);
            }
        }

        info!("Ingress stopped");
    }

    /// Route one batch and acknowledge what should not come back.
    ///
    /// Returns the number of acknowledged messages.
    pub async fn process_batch(&self, messages: Vec<ReceivedMessage>) -> DispatchResult<usize> {
        metrics::record_pulled(messages.len());

        let mut ack_ids: Vec<String> = stream::iter(messages)
            .map(|received| self.handle(received))
            .buffer_unordered(self.concurrency)
            .filter_map(|ack_id| async move { ack_id })
            .collect()
            .await;
        ack_ids.sort();

        self.client.acknowledge(&ack_ids).await?;
        metrics::record_acked(ack_ids.len());
        Ok(ack_ids.len())
    }

    /// Route one message; returns its ack id when it must be acknowledged.
    async fn handle(&self, received: ReceivedMessage) -> Option<String> {
        let message_id = received.message.message_id.clone();

        let result = match received.message.decode_request() {
            Ok(request) => self.router.route(&request).await.map(|_| ()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                metrics::record_routed("routed");
                Some(received.ack_id)
            }
            Err(e) if e.is_permanent() => {
                warn!(message_id = %message_id, "Dropping request: {}", e);
                metrics::record_routed("rejected");
                Some(received.ack_id)
            }
            Err(e) => {
                error!(message_id = %message_id, "Routing failed, leaving for redelivery: {}", e);
                metrics::record_routed("retry");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use mediaflow_models::{JobStatus, WorkItem};
    use mediaflow_queue::{
        Delivery, FailureDisposition, MemoryWorkQueue, QueueError, QueueResult, WorkQueue,
    };
    use mediaflow_store::{JobStore, MemoryJobStore};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::config::PubSubConfig;
    use crate::pubsub::PubsubMessage;

    fn message(ack_id: &str, payload: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: ack_id.to_string(),
            message: PubsubMessage {
                data: STANDARD.encode(payload),
                message_id: format!("m-{}", ack_id),
                ..Default::default()
            },
        }
    }

    fn request_json(c24_job_id: &str, action: &str) -> String {
        json!({
            "c24_job_id": c24_job_id,
            "profile": "720p",
            "source": "gs://in/a.mov",
            "dest": "gs://out/a.mp4",
            "action": action,
        })
        .to_string()
    }

    fn ingress(server: &MockServer, router: IngestionRouter) -> Ingress {
        let client = PubSubClient::with_token_cache(
            PubSubConfig {
                project_id: "local".to_string(),
                subscription: "jobs-sub".to_string(),
                endpoint: server.uri(),
                emulator: true,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        Ingress::new(client, Arc::new(router), 4, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_batch_acks_routed_and_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/local/subscriptions/jobs-sub:acknowledge"))
            .and(body_json(json!({ "ackIds": ["a1", "a2", "a3"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let ingress = ingress(
            &server,
            IngestionRouter::new(store.clone(), queue.clone()),
        );

        let acked = ingress
            .process_batch(vec![
                message("a1", &request_json("abc", "transcode")),
                message("a2", "not json"),
                message("a3", &request_json("def", "resize")),
            ])
            .await
            .unwrap();

        assert_eq!(acked, 3);
        assert_eq!(store.job_count().await, 1);
        assert_eq!(queue.len("transcode").await.unwrap(), 1);
    }

    /// Broker that refuses every call.
    struct DownQueue;

    #[async_trait::async_trait]
    impl WorkQueue for DownQueue {
        async fn enqueue(&self, _queue: &str, _item: &WorkItem) -> QueueResult<String> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn fetch(
            &self,
            _queue: &str,
            _consumer: &str,
            _count: usize,
            _block: Duration,
        ) -> QueueResult<Vec<Delivery>> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn ack(&self, _queue: &str, _delivery: &Delivery) -> QueueResult<()> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn touch(&self, _queue: &str, _consumer: &str, _delivery: &Delivery) -> QueueResult<()> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn claim_stale(
            &self,
            _queue: &str,
            _consumer: &str,
            _min_idle: Duration,
            _count: usize,
        ) -> QueueResult<Vec<Delivery>> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn record_failure(
            &self,
            _queue: &str,
            _delivery: &Delivery,
            _error: &str,
        ) -> QueueResult<FailureDisposition> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn len(&self, _queue: &str) -> QueueResult<u64> {
            Err(QueueError::connection_failed("connection refused"))
        }

        async fn dead_letter_len(&self, _queue: &str) -> QueueResult<u64> {
            Err(QueueError::connection_failed("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_not_acked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/local/subscriptions/jobs-sub:acknowledge"))
            .and(body_json(json!({ "ackIds": ["a2"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryJobStore::new());
        let ingress = ingress(
            &server,
            IngestionRouter::new(store.clone(), Arc::new(DownQueue)),
        );

        let acked = ingress
            .process_batch(vec![
                message("a1", &request_json("abc", "download")),
                message("a2", "not json"),
            ])
            .await
            .unwrap();

        assert_eq!(acked, 1);
        let jobs = store.list_jobs(0, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/local/subscriptions/jobs-sub:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let ingress = Arc::new(ingress(
            &server,
            IngestionRouter::new(
                Arc::new(MemoryJobStore::new()),
                Arc::new(MemoryWorkQueue::default()),
            ),
        ));

        let running = {
            let ingress = Arc::clone(&ingress);
            tokio::spawn(async move { ingress.run().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ingress.shutdown();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();
    }
}
