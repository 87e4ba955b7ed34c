//! Ingestion router.
//!
//! Turns a validated request into a persisted job and a queued work item.
//! Transcode requests additionally get a dedicated worker when provisioning
//! is configured.

use std::sync::Arc;

use tracing::{error, info, warn};

use mediaflow_models::{IngestRequest, Job, JobAction, JobStatus, WorkItem};
use mediaflow_provisioner::{Provisioner, ResourceTier};
use mediaflow_queue::WorkQueue;
use mediaflow_store::JobStore;

use crate::error::{DispatchError, DispatchResult};
use crate::metrics;

pub struct IngestionRouter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    provisioner: Option<Arc<Provisioner>>,
    tier: ResourceTier,
}

impl IngestionRouter {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            store,
            queue,
            provisioner: None,
            tier: ResourceTier::default(),
        }
    }

    /// Submit a dedicated worker for every routed transcode.
    pub fn with_provisioner(mut self, provisioner: Arc<Provisioner>, tier: ResourceTier) -> Self {
        self.provisioner = Some(provisioner);
        self.tier = tier;
        self
    }

    /// Route one request: validate, persist, provision, then enqueue.
    ///
    /// The job is persisted in `queued` status before the work item is
    /// enqueued. A transcode that got a dedicated worker is enqueued on that
    /// worker's own queue so no other pod can take it; without one it goes to
    /// the shared pool. If the enqueue fails the job is marked `error` and the
    /// error is returned so the message is redelivered.
    pub async fn route(&self, request: &IngestRequest) -> DispatchResult<Job> {
        let action = request.validate()?;
        let shared_queue = action
            .queue_name()
            .ok_or_else(|| DispatchError::Unsupported(action.to_string()))?;

        let job = self.store.create(request.to_new_job(action)).await?;
        info!(
            guid = %job.guid,
            job_id = %job.c24_job_id,
            action = %action,
            profile = %job.profile,
            "Job created"
        );

        let queue_name = match action {
            JobAction::Transcode if self.provision(&job, action).await => action
                .dedicated_queue_name(&job.c24_job_id)
                .unwrap_or_else(|| shared_queue.to_string()),
            _ => shared_queue.to_string(),
        };

        let item = WorkItem::from_job(&job);
        if let Err(e) = self.queue.enqueue(&queue_name, &item).await {
            error!(guid = %job.guid, queue = %queue_name, "Failed to enqueue job: {}", e);
            if let Err(mark_err) = self.store.transition(&job.guid, JobStatus::Error).await {
                warn!(guid = %job.guid, "Failed to mark job as error: {}", mark_err);
            }
            return Err(e.into());
        }
        metrics::record_enqueued(shared_queue);

        Ok(job)
    }

    /// Request a dedicated worker. Returns whether one was created.
    async fn provision(&self, job: &Job, action: JobAction) -> bool {
        let Some(provisioner) = &self.provisioner else {
            return false;
        };

        match provisioner.provision(&job.c24_job_id, action, &self.tier).await {
            Ok(handle) => {
                info!(
                    guid = %job.guid,
                    worker_job = %handle.name,
                    namespace = %handle.namespace,
                    "Dedicated worker requested"
                );
                true
            }
            Err(e) => {
                warn!(
                    guid = %job.guid,
                    "Provisioning failed, job goes to the shared pool: {}",
                    e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use mediaflow_models::ModelError;
    use mediaflow_provisioner::{
        BatchJob, ClusterClient, ProvisionError, ProvisionResult, ProvisionerConfig,
    };
    use mediaflow_queue::{
        Delivery, FailureDisposition, MemoryWorkQueue, QueueError, QueueResult,
    };
    use mediaflow_store::MemoryJobStore;
    use tokio::sync::Mutex;

    fn request(action: &str) -> IngestRequest {
        IngestRequest {
            c24_job_id: "abc".to_string(),
            profile: "720p".to_string(),
            source: "gs://in/a.mov".to_string(),
            dest: "gs://out/a.mp4".to_string(),
            action: action.to_string(),
        }
    }

    /// Records the stored status of each job at the moment it is enqueued.
    struct ObservingQueue {
        store: Arc<MemoryJobStore>,
        inner: MemoryWorkQueue,
        seen: Mutex<Vec<Option<JobStatus>>>,
        fail: bool,
    }

    impl ObservingQueue {
        fn new(store: Arc<MemoryJobStore>, fail: bool) -> Self {
            Self {
                store,
                inner: MemoryWorkQueue::default(),
                seen: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl WorkQueue for ObservingQueue {
        async fn enqueue(&self, queue: &str, item: &WorkItem) -> QueueResult<String> {
            let stored = self.store.get_job_by_guid(&item.guid).await.unwrap();
            self.seen.lock().await.push(stored.map(|j| j.status));
            if self.fail {
                return Err(QueueError::connection_failed("connection refused"));
            }
            self.inner.enqueue(queue, item).await
        }

        async fn fetch(
            &self,
            queue: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> QueueResult<Vec<Delivery>> {
            self.inner.fetch(queue, consumer, count, block).await
        }

        async fn ack(&self, queue: &str, delivery: &Delivery) -> QueueResult<()> {
            self.inner.ack(queue, delivery).await
        }

        async fn touch(&self, queue: &str, consumer: &str, delivery: &Delivery) -> QueueResult<()> {
            self.inner.touch(queue, consumer, delivery).await
        }

        async fn claim_stale(
            &self,
            queue: &str,
            consumer: &str,
            min_idle: Duration,
            count: usize,
        ) -> QueueResult<Vec<Delivery>> {
            self.inner.claim_stale(queue, consumer, min_idle, count).await
        }

        async fn record_failure(
            &self,
            queue: &str,
            delivery: &Delivery,
            error: &str,
        ) -> QueueResult<FailureDisposition> {
            self.inner.record_failure(queue, delivery, error).await
        }

        async fn len(&self, queue: &str) -> QueueResult<u64> {
            self.inner.len(queue).await
        }

        async fn dead_letter_len(&self, queue: &str) -> QueueResult<u64> {
            self.inner.dead_letter_len(queue).await
        }
    }

    #[derive(Default)]
    struct FakeCluster {
        submitted: Mutex<Vec<BatchJob>>,
        reject: bool,
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn create_job(&self, _namespace: &str, job: &BatchJob) -> ProvisionResult<BatchJob> {
            if self.reject {
                return Err(ProvisionError::Rejected {
                    status: 403,
                    message: "forbidden".to_string(),
                });
            }
            self.submitted.lock().await.push(job.clone());
            Ok(job.clone())
        }
    }

    fn provisioner(cluster: Arc<FakeCluster>) -> Arc<Provisioner> {
        Arc::new(Provisioner::new(
            cluster,
            ProvisionerConfig {
                enabled: true,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_job_is_queued_before_enqueue() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(ObservingQueue::new(store.clone(), false));
        let router = IngestionRouter::new(store.clone(), queue.clone());

        for action in ["download", "transcode"] {
            router.route(&request(action)).await.unwrap();
        }

        assert_eq!(store.job_count().await, 2);
        assert_eq!(
            *queue.seen.lock().await,
            vec![Some(JobStatus::Queued), Some(JobStatus::Queued)]
        );
        assert_eq!(queue.inner.ready_items("download").await.len(), 1);
        assert_eq!(queue.inner.ready_items("transcode").await.len(), 1);
    }

    #[tokio::test]
    async fn test_transcode_scenario() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let router = IngestionRouter::new(store.clone(), queue.clone());

        let job = router.route(&request("transcode")).await.unwrap();

        let stored = store.get_job_by_guid(&job.guid).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.encode_data.progress, 0.0);

        let items = queue.ready_items("transcode").await;
        assert_eq!(items, vec![WorkItem::from_job(&job)]);
        assert_eq!(items[0].c24_job_id, "abc");
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected_without_a_job() {
        let store = Arc::new(MemoryJobStore::new());
        let router = IngestionRouter::new(store.clone(), Arc::new(MemoryWorkQueue::default()));

        let err = router.route(&request("resize")).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InvalidRequest(ModelError::UnknownAction(_))
        ));
        assert!(err.is_permanent());
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_snippetize_is_not_supported() {
        let store = Arc::new(MemoryJobStore::new());
        let router = IngestionRouter::new(store.clone(), Arc::new(MemoryWorkQueue::default()));

        let err = router.route(&request("snippetize")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Unsupported(_)));
        assert!(err.is_permanent());
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_enqueue_failure_marks_job_error() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(ObservingQueue::new(store.clone(), true));
        let router = IngestionRouter::new(store.clone(), queue);

        let err = router.route(&request("download")).await.unwrap_err();
        assert!(!err.is_permanent());

        let jobs = store.list_jobs(0, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
    }

    #[tokio::test]
    async fn test_only_transcode_is_provisioned() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let cluster = Arc::new(FakeCluster::default());
        let router = IngestionRouter::new(store, queue.clone())
            .with_provisioner(provisioner(cluster.clone()), ResourceTier::default());

        router.route(&request("download")).await.unwrap();
        assert!(cluster.submitted.lock().await.is_empty());
        assert_eq!(queue.ready_items("download").await.len(), 1);

        router.route(&request("transcode")).await.unwrap();
        let submitted = cluster.submitted.lock().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(
            submitted[0].metadata.generate_name.as_deref(),
            Some("transcoder-abc-")
        );
    }

    #[tokio::test]
    async fn test_provisioned_transcode_goes_to_its_own_queue() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let cluster = Arc::new(FakeCluster::default());
        let router = IngestionRouter::new(store, queue.clone())
            .with_provisioner(provisioner(cluster), ResourceTier::default());

        let mut other = request("transcode");
        other.c24_job_id = "other".to_string();
        router.route(&request("transcode")).await.unwrap();
        router.route(&other).await.unwrap();

        assert!(queue.ready_items("transcode").await.is_empty());
        let abc = queue.ready_items("transcode:abc").await;
        assert_eq!(abc.len(), 1);
        assert_eq!(abc[0].c24_job_id, "abc");
        let other = queue.ready_items("transcode:other").await;
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].c24_job_id, "other");
    }

    #[tokio::test]
    async fn test_provisioning_failure_keeps_job_queued() {
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::default());
        let cluster = Arc::new(FakeCluster {
            reject: true,
            ..Default::default()
        });
        let router = IngestionRouter::new(store.clone(), queue.clone())
            .with_provisioner(provisioner(cluster), ResourceTier::default());

        let job = router.route(&request("transcode")).await.unwrap();

        let stored = store.get_job_by_guid(&job.guid).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(queue.len("transcode").await.unwrap(), 1);
        assert!(queue.ready_items("transcode:abc").await.is_empty());
    }
}
