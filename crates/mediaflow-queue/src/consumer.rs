//! Queue consumption with bounded concurrency.
//!
//! Every running delivery is heartbeated so other consumers never mistake
//! it for abandoned, and a consumer never runs the same delivery twice at
//! once.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mediaflow_models::WorkItem;

use crate::error::QueueResult;
use crate::queue::{Delivery, FailureDisposition, WorkQueue};

/// Processes one work item.
///
/// An `Err` marks the delivery failed; the queue retries it up to its bound
/// and then dead-letters it.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    type Error: Display + Send;

    async fn handle(&self, item: WorkItem) -> Result<(), Self::Error>;
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How long one fetch waits for new items
    pub block: Duration,
    /// Upper bound on items fetched per round trip
    pub batch_size: usize,
    /// How often to look for deliveries abandoned by dead consumers
    pub claim_interval: Duration,
    /// Idle time after which a delivery counts as abandoned
    pub claim_min_idle: Duration,
    /// Pause after a failed fetch
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight items
    pub shutdown_timeout: Duration,
    /// How long `consume_one` waits for an item before giving up
    pub idle_timeout: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            block: Duration::from_secs(1),
            batch_size: 5,
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl ConsumerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            claim_interval: secs("WORKER_CLAIM_INTERVAL_SECS", defaults.claim_interval),
            claim_min_idle: secs("WORKER_CLAIM_MIN_IDLE_SECS", defaults.claim_min_idle),
            shutdown_timeout: secs("WORKER_SHUTDOWN_TIMEOUT", defaults.shutdown_timeout),
            // 0 waits forever
            idle_timeout: match std::env::var("WORKER_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.idle_timeout,
            },
            ..defaults
        }
    }

    /// Lease refresh period for running deliveries, well inside
    /// `claim_min_idle`.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.claim_min_idle / 3).max(Duration::from_millis(10))
    }
}

/// What a running delivery needs besides its handler.
#[derive(Clone)]
struct RunContext {
    queue: Arc<dyn WorkQueue>,
    queue_name: String,
    consumer_name: String,
    heartbeat: Duration,
    /// Message ids this consumer is running right now
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Runs a handler over one named queue.
pub struct QueueConsumer {
    queue: Arc<dyn WorkQueue>,
    config: ConsumerConfig,
    consumer_name: String,
    shutdown: watch::Sender<bool>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn WorkQueue>, config: ConsumerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            config,
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            shutdown,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Signal shutdown. Running loops stop fetching and drain in-flight items.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn context(&self, queue_name: &str) -> RunContext {
        RunContext {
            queue: Arc::clone(&self.queue),
            queue_name: queue_name.to_string(),
            consumer_name: self.consumer_name.clone(),
            heartbeat: self.config.heartbeat_interval(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Serve `queue_name` with `concurrency` parallel slots until shutdown.
    pub async fn consume<H: WorkHandler>(
        &self,
        queue_name: &str,
        concurrency: usize,
        handler: Arc<H>,
    ) -> QueueResult<()> {
        let concurrency = concurrency.max(1);
        info!(
            "Consumer '{}' serving queue '{}' with {} slots",
            self.consumer_name, queue_name, concurrency
        );

        self.queue.prepare(queue_name).await?;

        let slots = Arc::new(Semaphore::new(concurrency));
        let claim_task = self.spawn_claim_task(queue_name, Arc::clone(&slots), Arc::clone(&handler));

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping consumer");
                        break;
                    }
                }
                result = self.fetch_and_dispatch(queue_name, &slots, &handler) => {
                    if let Err(e) = result {
                        error!(queue = %queue_name, "Error consuming work items: {}", e);
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                }
            }
        }

        claim_task.abort();

        info!("Waiting for in-flight work items to complete...");
        if tokio::time::timeout(
            self.config.shutdown_timeout,
            slots.acquire_many(concurrency as u32),
        )
        .await
        .is_err()
        {
            warn!("In-flight work items still running after shutdown timeout");
        }

        info!("Consumer '{}' stopped", self.consumer_name);
        Ok(())
    }

    /// Serve exactly one item from `queue_name`, then return.
    ///
    /// Returns `false` if shutdown arrived, or `idle_timeout` passed, before
    /// any item did.
    pub async fn consume_one<H: WorkHandler>(
        &self,
        queue_name: &str,
        handler: Arc<H>,
    ) -> QueueResult<bool> {
        self.queue.prepare(queue_name).await?;
        let mut shutdown_rx = self.shutdown.subscribe();
        let deadline = self
            .config
            .idle_timeout
            .map(|idle| tokio::time::Instant::now() + idle);

        loop {
            if *shutdown_rx.borrow() {
                return Ok(false);
            }

            let block = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if left.is_zero() {
                        info!(queue = %queue_name, "No work item arrived before the idle timeout");
                        return Ok(false);
                    }
                    // A zero block would wait forever on Redis
                    self.config.block.min(left).max(Duration::from_millis(1))
                }
                None => self.config.block,
            };

            let fetched = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                fetched = self.queue.fetch(queue_name, &self.consumer_name, 1, block) => fetched?,
            };

            if let Some(delivery) = fetched.into_iter().next() {
                execute(self.context(queue_name), delivery, handler).await;
                return Ok(true);
            }
        }
    }

    async fn fetch_and_dispatch<H: WorkHandler>(
        &self,
        queue_name: &str,
        slots: &Arc<Semaphore>,
        handler: &Arc<H>,
    ) -> QueueResult<()> {
        let available = slots.available_permits();
        if available == 0 {
            // All slots busy
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .fetch(
                queue_name,
                &self.consumer_name,
                available.min(self.config.batch_size),
                self.config.block,
            )
            .await?;

        if !deliveries.is_empty() {
            debug!(queue = %queue_name, count = deliveries.len(), "Dispatching work items");
        }

        for delivery in deliveries {
            let Ok(permit) = Arc::clone(slots).acquire_owned().await else {
                break;
            };
            let ctx = self.context(queue_name);
            let handler = Arc::clone(handler);

            tokio::spawn(async move {
                let _permit = permit;
                execute(ctx, delivery, handler).await;
            });
        }

        Ok(())
    }

    fn spawn_claim_task<H: WorkHandler>(
        &self,
        queue_name: &str,
        slots: Arc<Semaphore>,
        handler: Arc<H>,
    ) -> tokio::task::JoinHandle<()> {
        let ctx = self.context(queue_name);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.claim_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let batch = slots.available_permits().min(config.batch_size);
                        if batch == 0 {
                            continue;
                        }
                        let claimed = match ctx
                            .queue
                            .claim_stale(&ctx.queue_name, &ctx.consumer_name, config.claim_min_idle, batch)
                            .await
                        {
                            Ok(claimed) => claimed,
                            Err(e) => {
                                warn!(queue = %ctx.queue_name, "Failed to claim stale work items: {}", e);
                                continue;
                            }
                        };

                        for delivery in claimed {
                            if ctx.in_flight.lock().await.contains(&delivery.message_id) {
                                debug!(queue = %ctx.queue_name, message_id = %delivery.message_id, "Claimed item is already running here");
                                continue;
                            }
                            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                                return;
                            };
                            let ctx = ctx.clone();
                            let handler = Arc::clone(&handler);
                            tokio::spawn(async move {
                                let _permit = permit;
                                execute(ctx, delivery, handler).await;
                            });
                        }
                    }
                }
            }
        })
    }
}

/// Run the handler for one delivery and settle it with the queue.
///
/// The handler runs in its own task so a panic is contained and counted as
/// a failure instead of taking the slot down. While it runs the delivery is
/// touched every heartbeat period.
async fn execute<H: WorkHandler>(ctx: RunContext, delivery: Delivery, handler: Arc<H>) {
    let queue_name = ctx.queue_name.as_str();
    let guid = delivery.item.guid.clone();

    if !ctx.in_flight.lock().await.insert(delivery.message_id.clone()) {
        debug!(queue = %queue_name, guid = %guid, "Work item already running, skipping duplicate delivery");
        return;
    }
    info!(queue = %queue_name, guid = %guid, message_id = %delivery.message_id, "Executing work item");

    let item = delivery.item.clone();
    let mut task = tokio::spawn(async move { handler.handle(item).await.map_err(|e| e.to_string()) });

    let mut heartbeat = tokio::time::interval(ctx.heartbeat);
    heartbeat.tick().await;
    let outcome = loop {
        tokio::select! {
            outcome = &mut task => break outcome,
            _ = heartbeat.tick() => {
                if let Err(e) = ctx.queue.touch(queue_name, &ctx.consumer_name, &delivery).await {
                    warn!(queue = %queue_name, guid = %guid, "Failed to refresh work item lease: {}", e);
                }
            }
        }
    };

    let result = match outcome {
        Ok(result) => result,
        Err(join_err) => Err(format!("handler panicked: {}", join_err)),
    };

    match result {
        Ok(()) => {
            counter!("mediaflow_queue_items_total", "queue" => queue_name.to_string(), "outcome" => "ok")
                .increment(1);
            if let Err(e) = ctx.queue.ack(queue_name, &delivery).await {
                error!(queue = %queue_name, guid = %guid, "Failed to ack work item: {}", e);
            }
        }
        Err(e) => {
            counter!("mediaflow_queue_items_total", "queue" => queue_name.to_string(), "outcome" => "failed")
                .increment(1);
            error!(queue = %queue_name, guid = %guid, "Work item failed: {}", e);

            match ctx.queue.record_failure(queue_name, &delivery, &e).await {
                Ok(FailureDisposition::Retry { attempt, max }) => {
                    info!(queue = %queue_name, guid = %guid, "Work item will be redelivered (attempt {}/{})", attempt, max);
                }
                Ok(FailureDisposition::DeadLettered) => {
                    warn!(queue = %queue_name, guid = %guid, "Work item dead-lettered");
                }
                Err(record_err) => {
                    error!(queue = %queue_name, guid = %guid, "Failed to record work item failure: {}", record_err);
                }
            }
        }
    }

    ctx.in_flight.lock().await.remove(&delivery.message_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mediaflow_models::{JobAction, JobGuid};

    use crate::memory::MemoryWorkQueue;

    fn item(guid: &str) -> WorkItem {
        WorkItem {
            guid: JobGuid::from_string(guid),
            profile: "720p".to_string(),
            source: "s3://in/a.mov".to_string(),
            destination: "local".to_string(),
            c24_job_id: guid.to_string(),
            action: JobAction::Download,
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            block: Duration::from_millis(20),
            claim_interval: Duration::from_secs(3600),
            error_backoff: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Fails items whose GUID starts with "bad", panics on "panic".
    struct Recording {
        handled: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recording {
        fn new() -> Self {
            Self {
                handled: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkHandler for Recording {
        type Error = String;

        async fn handle(&self, item: WorkItem) -> Result<(), String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);

            if item.guid.as_str() == "panic" {
                panic!("handler blew up");
            }
            if item.guid.as_str().starts_with("bad") {
                return Err("stage failed".to_string());
            }
            Ok(())
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_consume_respects_concurrency() {
        let queue = Arc::new(MemoryWorkQueue::default());
        for i in 0..6 {
            queue.enqueue("download", &item(&format!("g{}", i))).await.unwrap();
        }

        let consumer = Arc::new(QueueConsumer::new(queue.clone(), fast_config()));
        let handler = Arc::new(Recording::new());

        let run = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume("download", 2, handler).await })
        };

        wait_until(|| handler.handled.load(Ordering::SeqCst) == 6).await;
        consumer.shutdown();
        run.await.unwrap().unwrap();

        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(queue.len("download").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failures_and_panics_dead_letter_without_killing_slots() {
        let queue = Arc::new(MemoryWorkQueue::new(2));
        queue.enqueue("download", &item("bad-1")).await.unwrap();
        queue.enqueue("download", &item("panic")).await.unwrap();
        queue.enqueue("download", &item("good")).await.unwrap();

        let consumer = Arc::new(QueueConsumer::new(queue.clone(), fast_config()));
        let handler = Arc::new(Recording::new());

        let run = {
            let consumer = consumer.clone();
            let handler = handler.clone();
            tokio::spawn(async move { consumer.consume("download", 1, handler).await })
        };

        let probe = queue.clone();
        for _ in 0..200 {
            if probe.dead_letter_len("download").await.unwrap() == 2
                && probe.len("download").await.unwrap() == 0
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        consumer.shutdown();
        run.await.unwrap().unwrap();

        assert_eq!(queue.dead_letter_len("download").await.unwrap(), 2);
        assert_eq!(queue.len("download").await.unwrap(), 0);
        // bad-1 and panic twice each, good once
        assert_eq!(handler.handled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_consume_one_serves_single_item() {
        let queue = Arc::new(MemoryWorkQueue::default());
        queue.enqueue("transcode", &item("g1")).await.unwrap();
        queue.enqueue("transcode", &item("g2")).await.unwrap();

        let consumer = QueueConsumer::new(queue.clone(), fast_config());
        let handler = Arc::new(Recording::new());

        assert!(consumer.consume_one("transcode", handler.clone()).await.unwrap());
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len("transcode").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_consume_one_returns_false_on_shutdown() {
        let queue = Arc::new(MemoryWorkQueue::default());
        let consumer = QueueConsumer::new(queue, fast_config());
        consumer.shutdown();

        let served = consumer
            .consume_one("transcode", Arc::new(Recording::new()))
            .await
            .unwrap();
        assert!(!served);
    }

    /// Sleeps through every claim deadline and records overlap per item.
    struct Slow {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Slow {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WorkHandler for Slow {
        type Error = String;

        async fn handle(&self, _item: WorkItem) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(400)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_long_running_item_is_never_run_twice() {
        let queue = Arc::new(MemoryWorkQueue::default());
        queue.enqueue("transcode", &item("g1")).await.unwrap();

        let config = ConsumerConfig {
            claim_interval: Duration::from_millis(50),
            claim_min_idle: Duration::from_millis(100),
            ..fast_config()
        };
        let handler = Arc::new(Slow::new());

        // Two consumers on the same queue, each free to claim stale work
        let consumers: Vec<_> = (0..2)
            .map(|_| Arc::new(QueueConsumer::new(queue.clone(), config.clone())))
            .collect();
        let runs: Vec<_> = consumers
            .iter()
            .map(|consumer| {
                let consumer = consumer.clone();
                let handler = handler.clone();
                tokio::spawn(async move { consumer.consume("transcode", 4, handler).await })
            })
            .collect();

        let watcher = queue.clone();
        for _ in 0..200 {
            if watcher.len("transcode").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Leave the claim tasks a few more rounds
        tokio::time::sleep(Duration::from_millis(200)).await;

        for consumer in &consumers {
            consumer.shutdown();
        }
        for run in runs {
            run.await.unwrap().unwrap();
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len("transcode").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_one_gives_up_after_idle_timeout() {
        let queue = Arc::new(MemoryWorkQueue::default());
        // Work for another job on the shared queue is not this pod's
        queue.enqueue("transcode", &item("other")).await.unwrap();

        let consumer = QueueConsumer::new(
            queue.clone(),
            ConsumerConfig {
                idle_timeout: Some(Duration::from_millis(100)),
                ..fast_config()
            },
        );
        let handler = Arc::new(Recording::new());

        let served = tokio::time::timeout(
            Duration::from_secs(2),
            consumer.consume_one("transcode:abc", handler.clone()),
        )
        .await
        .expect("consume_one did not return")
        .unwrap();

        assert!(!served);
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
        assert_eq!(queue.ready_items("transcode").await.len(), 1);
    }

    #[test]
    fn test_heartbeat_inside_claim_deadline() {
        let config = ConsumerConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(100));
        assert!(config.heartbeat_interval() < config.claim_min_idle);
    }
}
