//! Staged job execution.
//!
//! One [`PipelineExecutor`] serves every work item a worker dequeues. It
//! reloads the job record, runs the stage sequence for the job's action and
//! records each status change as it goes. Stages are fail-fast: the first
//! failure marks the job `error` and the remaining stages are skipped.
//!
//! Items are delivered at least once, so the same job can arrive again.
//! A job already `completed` or `error` is left alone, and a job picked up
//! mid-flight only ever moves its status forward.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, Instrument};

use mediaflow_media::{EncodeOptions, FfmpegProgress, MediaEncoder, MediaInspector, MediaReport};
use mediaflow_models::{EncodeProfile, Job, JobAction, JobStatus, ProfileCatalog, WorkItem};
use mediaflow_storage::StorageTransfer;
use mediaflow_store::JobStore;

use crate::config::{WorkLayout, WorkerConfig};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::monitor::{MonitorTarget, ProgressMonitor};
use crate::notify::{encode_success_message, Notifier};
use crate::stage::Stage;

/// Destination value meaning "keep the result on the worker's volume".
pub const LOCAL_DESTINATION: &str = "local";

/// Runs jobs through their stages.
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    storage: Arc<dyn StorageTransfer>,
    inspector: Arc<dyn MediaInspector>,
    encoder: Arc<dyn MediaEncoder>,
    notifier: Arc<dyn Notifier>,
    profiles: Arc<ProfileCatalog>,
    layout: WorkLayout,
    progress_interval: Duration,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        storage: Arc<dyn StorageTransfer>,
        inspector: Arc<dyn MediaInspector>,
        encoder: Arc<dyn MediaEncoder>,
        notifier: Arc<dyn Notifier>,
        profiles: Arc<ProfileCatalog>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            storage,
            inspector,
            encoder,
            notifier,
            profiles,
            layout: config.layout(),
            progress_interval: config.progress_interval,
        }
    }

    /// Execute one work item.
    ///
    /// Job failures (a failed stage, an unknown profile, an unsupported
    /// action) are recorded on the job and return `Ok`. Errors are returned
    /// only when the job could not be loaded or its outcome could not be
    /// recorded, so the queue redelivers the item. Jobs in a terminal status
    /// return `Ok` without running anything.
    pub async fn execute(&self, item: &WorkItem) -> WorkerResult<()> {
        let job = self
            .store
            .get_job_by_guid(&item.guid)
            .await?
            .ok_or_else(|| WorkerError::JobNotFound(item.guid.to_string()))?;

        let logger = JobLogger::new(&job.guid, &job.c24_job_id, job.action.as_str());
        if job.status.is_terminal() {
            logger.log_warning(&format!("job already {}, skipping redelivered item", job.status));
            return Ok(());
        }

        let span = logger.create_span();
        self.execute_job(&job, &logger).instrument(span).await
    }

    async fn execute_job(&self, job: &Job, logger: &JobLogger) -> WorkerResult<()> {
        let action = job.action.as_str();
        logger.log_start(&format!(
            "profile={} source={} destination={}",
            job.profile, job.source, job.destination
        ));
        metrics::record_job_started(action);

        let mut status = job.status;
        let result = match job.action {
            JobAction::Download => self.run_download(job, &mut status, logger).await,
            JobAction::Transcode => self.run_transcode(job, &mut status, logger).await,
            JobAction::Snippetize => Err(WorkerError::UnsupportedAction(action.to_string())),
        };

        match result {
            Ok(()) => {
                metrics::record_job_completed(action);
                logger.log_completion("all stages finished");
                Ok(())
            }
            Err(e) if e.is_job_failure() => {
                logger.log_error(&e.to_string());
                let stage = match &e {
                    WorkerError::StageFailed { stage, .. } => Some(*stage),
                    _ => None,
                };
                metrics::record_job_failed(action, stage);
                self.advance(job, &mut status, JobStatus::Error).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch the source to the worker volume and optionally push it on.
    async fn run_download(
        &self,
        job: &Job,
        status: &mut JobStatus,
        logger: &JobLogger,
    ) -> WorkerResult<()> {
        let staged = self.layout.staged_source(&job.c24_job_id);

        self.run_stage(job, status, Stage::Download, logger, async {
            self.stage_source(job, &staged).await?;
            if job.destination != LOCAL_DESTINATION {
                self.storage.upload(&staged, &job.destination).await?;
            }
            Ok(())
        })
        .await?;

        self.advance(job, status, JobStatus::Completed).await
    }

    async fn run_transcode(
        &self,
        job: &Job,
        status: &mut JobStatus,
        logger: &JobLogger,
    ) -> WorkerResult<()> {
        let profile = self
            .profiles
            .get(&job.profile)
            .cloned()
            .ok_or_else(|| WorkerError::ProfileNotFound(job.profile.clone()))?;

        let source = self.layout.staged_source(&job.c24_job_id);
        let output = self.layout.encode_output(&job.c24_job_id, &profile);

        // A dedicated download job may already have staged the source
        if tokio::fs::try_exists(&source).await? {
            logger.log_progress(&format!("using staged source {}", source.display()));
        } else {
            self.run_stage(job, status, Stage::Download, logger, self.stage_source(job, &source))
                .await?;
        }

        let report = self
            .run_stage(job, status, Stage::Probe, logger, self.probe(job, &source, logger))
            .await?;

        self.run_stage(
            job,
            status,
            Stage::Encode,
            logger,
            self.encode(job, &source, &output, &profile, &report, logger),
        )
        .await?;

        self.run_stage(job, status, Stage::Upload, logger, self.upload(job, &output, logger))
            .await?;

        self.advance(job, status, JobStatus::Completed).await?;
        self.notify_success(job, logger).await;
        Ok(())
    }

    /// Run one stage: enter its status, reset progress, run `op`, then mark
    /// progress complete and write the stage's done status if it has one.
    async fn run_stage<T, F>(
        &self,
        job: &Job,
        status: &mut JobStatus,
        stage: Stage,
        logger: &JobLogger,
        op: F,
    ) -> WorkerResult<T>
    where
        F: Future<Output = WorkerResult<T>>,
    {
        let logger = logger.for_operation(stage.as_str());

        self.advance(job, status, stage.in_progress_status()).await?;
        self.write_progress(job, 0.0, &logger).await;
        logger.log_start(stage.as_str());

        let started = Instant::now();
        let result = op.await;
        metrics::record_stage_duration(stage, started.elapsed(), result.is_ok());

        let value = result.map_err(|e| match e {
            WorkerError::Store(_) | WorkerError::StageFailed { .. } => e,
            other => WorkerError::stage_failed(stage, other.to_string()),
        })?;

        self.write_progress(job, 100.0, &logger).await;
        if let Some(done) = stage.done_status() {
            self.advance(job, status, done).await?;
        }
        logger.log_completion(stage.as_str());
        Ok(value)
    }

    /// Write `next` if it moves the job forward from `status`.
    async fn advance(&self, job: &Job, status: &mut JobStatus, next: JobStatus) -> WorkerResult<()> {
        if !status.can_transition_to(next) {
            debug!(guid = %job.guid, from = %status, to = %next, "Keeping later status");
            return Ok(());
        }
        self.store.transition(&job.guid, next).await?;
        *status = next;
        Ok(())
    }

    /// Best effort; a failed write never fails the stage.
    async fn write_progress(&self, job: &Job, percent: f64, logger: &JobLogger) {
        if let Err(e) = self
            .store
            .record_progress(job.encode_data.id, percent)
            .await
        {
            logger.log_warning(&format!("Failed to record progress: {}", e));
        }
    }

    async fn stage_source(&self, job: &Job, target: &Path) -> WorkerResult<()> {
        self.storage.download(&job.source, target).await?;

        if !tokio::fs::try_exists(target).await? {
            return Err(WorkerError::stage_failed(
                Stage::Download,
                format!("{} missing after download", target.display()),
            ));
        }
        Ok(())
    }

    async fn probe(&self, job: &Job, source: &Path, logger: &JobLogger) -> WorkerResult<MediaReport> {
        let report = self.inspector.probe(source).await?;

        match report.to_json() {
            Ok(payload) => {
                if let Err(e) = self
                    .store
                    .record_diagnostics(job.encode_data.id, &payload)
                    .await
                {
                    logger.log_warning(&format!("Failed to record probe report: {}", e));
                }
            }
            Err(e) => logger.log_warning(&format!("Failed to serialize probe report: {}", e)),
        }
        Ok(report)
    }

    async fn encode(
        &self,
        job: &Job,
        source: &Path,
        output: &Path,
        profile: &EncodeProfile,
        report: &MediaReport,
        logger: &JobLogger,
    ) -> WorkerResult<()> {
        let total_frames = report.total_frames();
        if total_frames.is_none() {
            logger.log_warning("frame count unknown, encode percentage unavailable");
        }

        let (progress_tx, progress_rx) = watch::channel(FfmpegProgress::default());
        let monitor = ProgressMonitor::start(
            MonitorTarget {
                store: Arc::clone(&self.store),
                encode_data_id: job.encode_data.id,
                stage: Stage::Encode,
                total_frames,
                logger: logger.for_operation(Stage::Encode.as_str()),
            },
            progress_rx,
            self.progress_interval,
        );

        let options = EncodeOptions::from(profile);
        let result = self
            .encoder
            .encode(source, output, &options, progress_tx)
            .await;
        monitor.stop().await;

        result?;
        Ok(())
    }

    async fn upload(&self, job: &Job, output: &Path, logger: &JobLogger) -> WorkerResult<()> {
        if job.destination == LOCAL_DESTINATION {
            logger.log_progress(&format!("keeping {} on the worker volume", output.display()));
            return Ok(());
        }
        self.storage.upload(output, &job.destination).await?;
        Ok(())
    }

    async fn notify_success(&self, job: &Job, logger: &JobLogger) {
        let result = self.notifier.notify(&encode_success_message(job)).await;
        metrics::record_notification(result.is_ok());
        if let Err(e) = result {
            logger.log_warning(&format!("Notification failed: {}", e));
        }
    }
}
