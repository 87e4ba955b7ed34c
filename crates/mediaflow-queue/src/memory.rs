//! In-process work queues for local runs and tests.
//!
//! Same contract as the Redis backend, except that a failed delivery that is
//! still under the retry bound goes straight back to the ready list instead
//! of waiting for the stale-claim deadline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use mediaflow_models::WorkItem;

use crate::error::{QueueError, QueueResult};
use crate::queue::{Delivery, FailureDisposition, WorkQueue};

struct Pending {
    delivery: Delivery,
    since: Instant,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Delivery>,
    pending: HashMap<String, Pending>,
    dead: Vec<(Delivery, String)>,
    retries: HashMap<String, u32>,
    guids: HashSet<String>,
    /// Wakes fetchers blocked on this queue only
    notify: Arc<Notify>,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.pending.is_empty() && self.dead.is_empty()
    }
}

pub struct MemoryWorkQueue {
    max_retries: u32,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::new(3)
    }
}

impl MemoryWorkQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Items enqueued and not yet handed to a consumer.
    pub async fn ready_items(&self, queue: &str) -> Vec<WorkItem> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.ready.iter().map(|d| d.item.clone()).collect())
            .unwrap_or_default()
    }

    /// Dead-lettered items with their last error.
    pub async fn dead_letters(&self, queue: &str) -> Vec<(WorkItem, String)> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| {
                q.dead
                    .iter()
                    .map(|(d, e)| (d.item.clone(), e.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Move up to `count` ready items to pending. Also hands back the
    /// queue's notifier so an empty fetch can wait on it.
    async fn take_ready(&self, queue: &str, count: usize) -> (Vec<Delivery>, Arc<Notify>) {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        let mut taken = Vec::new();
        while taken.len() < count.max(1) {
            let Some(delivery) = state.ready.pop_front() else {
                break;
            };
            state.pending.insert(
                delivery.message_id.clone(),
                Pending {
                    delivery: delivery.clone(),
                    since: Instant::now(),
                },
            );
            taken.push(delivery);
        }
        (taken, Arc::clone(&state.notify))
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, queue: &str, item: &WorkItem) -> QueueResult<String> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        if !state.guids.insert(item.guid.to_string()) {
            return Err(QueueError::Duplicate(item.guid.to_string()));
        }

        state.next_id += 1;
        let message_id = format!("{}-0", state.next_id);
        state.ready.push_back(Delivery {
            message_id: message_id.clone(),
            item: item.clone(),
        });
        let notify = Arc::clone(&state.notify);
        drop(queues);

        notify.notify_one();
        Ok(message_id)
    }

    async fn fetch(
        &self,
        queue: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let (taken, notify) = self.take_ready(queue, count).await;
            if !taken.is_empty() {
                return Ok(taken);
            }
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, queue: &str, delivery: &Delivery) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.pending.remove(&delivery.message_id);
            state.retries.remove(&delivery.message_id);
            state.guids.remove(delivery.item.guid.as_str());
        }
        Ok(())
    }

    async fn claim_stale(
        &self,
        queue: &str,
        _consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        for pending in state.pending.values_mut() {
            if claimed.len() >= count {
                break;
            }
            if pending.since.elapsed() >= min_idle {
                pending.since = Instant::now();
                claimed.push(pending.delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn touch(&self, queue: &str, _consumer: &str, delivery: &Delivery) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        if let Some(pending) = queues
            .get_mut(queue)
            .and_then(|state| state.pending.get_mut(&delivery.message_id))
        {
            pending.since = Instant::now();
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        queue: &str,
        delivery: &Delivery,
        error: &str,
    ) -> QueueResult<FailureDisposition> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        let attempt = {
            let count = state.retries.entry(delivery.message_id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        state.pending.remove(&delivery.message_id);

        if attempt < self.max_retries {
            state.ready.push_back(delivery.clone());
            let notify = Arc::clone(&state.notify);
            drop(queues);
            notify.notify_one();
            return Ok(FailureDisposition::Retry {
                attempt,
                max: self.max_retries,
            });
        }

        state.retries.remove(&delivery.message_id);
        state.guids.remove(delivery.item.guid.as_str());
        state.dead.push((delivery.clone(), error.to_string()));
        Ok(FailureDisposition::DeadLettered)
    }

    async fn len(&self, queue: &str) -> QueueResult<u64> {
        let queues = self.queues.lock().await;
        Ok(queues
            .get(queue)
            .map(|q| (q.ready.len() + q.pending.len()) as u64)
            .unwrap_or(0))
    }

    async fn dead_letter_len(&self, queue: &str) -> QueueResult<u64> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|q| q.dead.len() as u64).unwrap_or(0))
    }

    async fn retire(&self, queue: &str) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        if queues.get(queue).is_some_and(QueueState::is_empty) {
            queues.remove(queue);
        }
        Ok(())
    }
}
