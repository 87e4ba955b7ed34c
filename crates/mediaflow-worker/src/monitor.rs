//! Live progress sampling for long-running stages.
//!
//! A stage starts one [`ProgressMonitor`] and owns it until the stage
//! operation returns. The background task holds only the receiving half of a
//! `oneshot` stop channel, so the monitor cannot be signalled twice and is
//! released when the owning stage drops it, even on early return.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use mediaflow_media::{frame_percentage, FfmpegProgress};
use mediaflow_store::JobStore;

use crate::logging::JobLogger;
use crate::metrics;
use crate::stage::Stage;

/// Inputs for one monitored stage.
pub struct MonitorTarget {
    pub store: Arc<dyn JobStore>,
    pub encode_data_id: i64,
    pub stage: Stage,
    /// Frame count from probe; `None` when unknown
    pub total_frames: Option<u64>,
    pub logger: JobLogger,
}

/// Handle to a running monitor task.
pub struct ProgressMonitor {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Sample `progress` every `period` until stopped.
    ///
    /// The first sample is taken one period after start.
    pub fn start(
        target: MonitorTarget,
        progress: watch::Receiver<FfmpegProgress>,
        period: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(sample_loop(target, progress, period, stop_rx));

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Signal the task and wait for it to exit.
    ///
    /// Once this returns the monitor writes nothing more.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn sample_loop(
    target: MonitorTarget,
    progress: watch::Receiver<FfmpegProgress>,
    period: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Stages reset progress to 0 before starting the monitor
    let mut last_written = 0.0_f64;

    loop {
        tokio::select! {
            biased;
            // Also resolves if the owning stage dropped the sender
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let frame = progress.borrow().frame;

                let Some(pct) = frame_percentage(frame, target.total_frames) else {
                    debug!(
                        guid = %target.logger.guid(),
                        stage = %target.stage,
                        frame,
                        "Progress percentage unavailable"
                    );
                    metrics::record_progress_sample(target.stage, false);
                    continue;
                };

                if pct <= last_written {
                    metrics::record_progress_sample(target.stage, false);
                    continue;
                }

                match target.store.record_progress(target.encode_data_id, pct).await {
                    Ok(()) => {
                        last_written = pct;
                        metrics::record_progress_sample(target.stage, true);
                        debug!(
                            guid = %target.logger.guid(),
                            stage = %target.stage,
                            frame,
                            percent = pct,
                            "Progress recorded"
                        );
                    }
                    Err(e) => {
                        target
                            .logger
                            .log_warning(&format!("Failed to record progress: {}", e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_models::{JobAction, NewJob};
    use mediaflow_store::MemoryJobStore;

    async fn setup() -> (Arc<MemoryJobStore>, i64, JobLogger) {
        let store = Arc::new(MemoryJobStore::new());
        let job = store
            .create(NewJob::new("abc", "720p", JobAction::Transcode, "gs://in/a.mov", "gs://out/a.mp4"))
            .await
            .unwrap();
        let logger = JobLogger::new(&job.guid, "abc", "encode");
        (store, job.encode_data.id, logger)
    }

    fn target(store: &Arc<MemoryJobStore>, id: i64, total: Option<u64>, logger: JobLogger) -> MonitorTarget {
        MonitorTarget {
            store: store.clone(),
            encode_data_id: id,
            stage: Stage::Encode,
            total_frames: total,
            logger,
        }
    }

    fn frames(n: u64) -> FfmpegProgress {
        FfmpegProgress {
            frame: n,
            ..Default::default()
        }
    }

    const PERIOD: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_samples_on_interval_and_stays_monotonic() {
        let (store, id, logger) = setup().await;
        let (tx, rx) = watch::channel(FfmpegProgress::default());
        let monitor = ProgressMonitor::start(target(&store, id, Some(200), logger), rx, PERIOD);

        tx.send_replace(frames(50));
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(store.progress_history(id).await, vec![0.0]);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(store.progress_history(id).await, vec![0.0, 25.0]);

        // A lower reading never moves progress backwards
        tx.send_replace(frames(20));
        tokio::time::sleep(PERIOD).await;
        assert_eq!(store.progress_history(id).await, vec![0.0, 25.0]);

        tx.send_replace(frames(1));
        tx.send_replace(frames(199));
        tokio::time::sleep(PERIOD).await;
        assert_eq!(store.progress_history(id).await, vec![0.0, 25.0, 99.5]);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_writes_after_stop() {
        let (store, id, logger) = setup().await;
        let (tx, rx) = watch::channel(frames(100));
        let monitor = ProgressMonitor::start(target(&store, id, Some(400), logger), rx, PERIOD);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        monitor.stop().await;
        let before = store.progress_history(id).await;
        assert_eq!(before, vec![0.0, 25.0]);

        tx.send_replace(frames(300));
        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(store.progress_history(id).await, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_sampling() {
        let (store, id, logger) = setup().await;
        let (tx, rx) = watch::channel(FfmpegProgress::default());
        let monitor = ProgressMonitor::start(target(&store, id, Some(100), logger), rx, PERIOD);
        drop(monitor);

        tx.send_replace(frames(50));
        tokio::time::sleep(PERIOD * 3).await;
        assert_eq!(store.progress_history(id).await, vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_total_frames_reports_unavailable() {
        let (store, id, logger) = setup().await;
        let (tx, rx) = watch::channel(FfmpegProgress::default());
        let monitor = ProgressMonitor::start(target(&store, id, Some(0), logger), rx, PERIOD);

        tx.send_replace(frames(120));
        tokio::time::sleep(PERIOD * 3).await;
        monitor.stop().await;

        assert_eq!(store.progress_history(id).await, vec![0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_clamped_to_100() {
        let (store, id, logger) = setup().await;
        let (_tx, rx) = watch::channel(frames(900));
        let monitor = ProgressMonitor::start(target(&store, id, Some(300), logger), rx, PERIOD);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        monitor.stop().await;

        assert_eq!(store.progress_history(id).await, vec![0.0, 100.0]);
    }

    #[tokio::test]
    async fn test_stop_before_first_tick() {
        let (store, id, logger) = setup().await;
        let (_tx, rx) = watch::channel(frames(10));
        let monitor = ProgressMonitor::start(
            target(&store, id, Some(10), logger),
            rx,
            Duration::from_secs(3600),
        );
        monitor.stop().await;
        assert_eq!(store.progress_history(id).await, vec![0.0]);
    }
}
