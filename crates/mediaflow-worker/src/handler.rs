//! Queue handler wiring the consumer to the pipeline.

use std::sync::Arc;

use async_trait::async_trait;

use mediaflow_models::{JobAction, WorkItem};
use mediaflow_queue::WorkHandler;

use crate::error::{WorkerError, WorkerResult};
use crate::pipeline::PipelineExecutor;

/// Serves one queue: every item goes through the pipeline.
pub struct JobHandler {
    executor: Arc<PipelineExecutor>,
}

impl JobHandler {
    pub fn new(executor: Arc<PipelineExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl WorkHandler for JobHandler {
    type Error = WorkerError;

    async fn handle(&self, item: WorkItem) -> Result<(), WorkerError> {
        self.executor.execute(&item).await
    }
}

/// Action served by a worker role name (`downloader`, `transcoder`).
pub fn action_for_role(role: &str) -> WorkerResult<JobAction> {
    JobAction::ALL
        .iter()
        .copied()
        .find(|action| action.worker_role() == Some(role))
        .ok_or_else(|| WorkerError::config_error(format!("unknown worker role '{}'", role)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_media::{FfmpegEncoder, FfprobeInspector};
    use mediaflow_models::{JobStatus, NewJob, ProfileCatalog};
    use mediaflow_queue::{ConsumerConfig, MemoryWorkQueue, QueueConsumer, WorkQueue};
    use mediaflow_storage::ObjectStoreClient;
    use mediaflow_store::{JobStore, MemoryJobStore};

    use crate::config::WorkerConfig;
    use crate::notify::SlackNotifier;

    #[tokio::test]
    async fn test_oneshot_download_from_queue() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.mov");
        tokio::fs::write(&source, b"bytes").await.unwrap();

        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .create(NewJob::new(
                "abc",
                "720p",
                JobAction::Download,
                source.to_string_lossy(),
                "local",
            ))
            .await
            .unwrap();

        let queue = Arc::new(MemoryWorkQueue::default());
        queue
            .enqueue("download", &WorkItem::from_job(&job))
            .await
            .unwrap();

        let config = WorkerConfig {
            work_dir: dir.path().join("work"),
            shared_dir: dir.path().join("shared"),
            ..Default::default()
        };
        let executor = PipelineExecutor::new(
            store.clone(),
            Arc::new(ObjectStoreClient::local_only()),
            Arc::new(FfprobeInspector),
            Arc::new(FfmpegEncoder),
            Arc::new(SlackNotifier::new(None).unwrap()),
            Arc::new(ProfileCatalog::builtin()),
            &config,
        );

        let consumer = QueueConsumer::new(queue.clone(), ConsumerConfig::default());
        let served = consumer
            .consume_one("download", Arc::new(JobHandler::new(Arc::new(executor))))
            .await
            .unwrap();

        assert!(served);
        assert_eq!(queue.len("download").await.unwrap(), 0);
        let done = store.get_job_by_guid(&job.guid).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(dir.path().join("work/src/abc").exists());
    }

    #[test]
    fn test_roles() {
        assert_eq!(action_for_role("downloader").unwrap(), JobAction::Download);
        assert_eq!(action_for_role("transcoder").unwrap(), JobAction::Transcode);
        assert!(action_for_role("snippetizer").is_err());
    }
}
