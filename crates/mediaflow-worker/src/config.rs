//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use mediaflow_models::{EncodeProfile, JobAction};

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parallel execution slots per queue
    pub concurrency: usize,
    /// Root for staged sources (`{work_dir}/src/{c24_job_id}`)
    pub work_dir: PathBuf,
    /// Root for encode outputs (`{shared_dir}/dst/...`)
    pub shared_dir: PathBuf,
    /// Progress sampling interval
    pub progress_interval: Duration,
    /// Serve one item and exit (dedicated worker pods)
    pub oneshot: bool,
    /// Name of the dedicated job this pod runs for, if any
    pub job_name: Option<String>,
    /// Prometheus listener port; 0 disables the exporter
    pub metrics_port: u16,
    /// JSON encode profile catalog
    pub profiles_path: Option<PathBuf>,
    /// Slack incoming webhook for completion notices
    pub slack_webhook_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            work_dir: PathBuf::from("/mpc"),
            shared_dir: PathBuf::from("/mpc"),
            progress_interval: Duration::from_millis(2000),
            oneshot: false,
            job_name: None,
            metrics_port: 9090,
            profiles_path: None,
            slack_webhook_url: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.concurrency),
            work_dir: non_empty("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            shared_dir: non_empty("WORKER_SHARED_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.shared_dir),
            progress_interval: Duration::from_millis(
                std::env::var("WORKER_PROGRESS_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|ms| *ms > 0)
                    .unwrap_or(2000),
            ),
            oneshot: std::env::var("WORKER_ONESHOT")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            job_name: non_empty("JOB_NAME"),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.metrics_port),
            profiles_path: non_empty("ENCODE_PROFILES_PATH").map(PathBuf::from),
            slack_webhook_url: non_empty("SLACK_WEBHOOK_URL"),
        }
    }

    /// Queue served for `action`. A oneshot pod started for a job serves
    /// only that job's queue; every other worker serves the shared one.
    pub fn queue_name(&self, action: JobAction) -> WorkerResult<String> {
        let dedicated = match (self.oneshot, &self.job_name) {
            (true, Some(job_name)) => action.dedicated_queue_name(job_name),
            _ => action.queue_name().map(str::to_string),
        };
        dedicated.ok_or_else(|| WorkerError::UnsupportedAction(action.to_string()))
    }

    /// Whether this worker serves a queue of its own.
    pub fn is_dedicated(&self) -> bool {
        self.oneshot && self.job_name.is_some()
    }

    pub fn layout(&self) -> WorkLayout {
        WorkLayout {
            work_dir: self.work_dir.clone(),
            shared_dir: self.shared_dir.clone(),
        }
    }
}

/// Local file layout shared by all stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    pub work_dir: PathBuf,
    pub shared_dir: PathBuf,
}

impl WorkLayout {
    /// Where a job's source is staged.
    pub fn staged_source(&self, c24_job_id: &str) -> PathBuf {
        self.work_dir.join("src").join(c24_job_id)
    }

    /// Where a job's rendition is written.
    pub fn encode_output(&self, c24_job_id: &str, profile: &EncodeProfile) -> PathBuf {
        self.shared_dir
            .join("dst")
            .join(format!("{}{}", c24_job_id, profile.output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_models::ProfileCatalog;
    use serial_test::serial;

    #[test]
    fn test_layout_paths() {
        let layout = WorkLayout {
            work_dir: PathBuf::from("/mpc"),
            shared_dir: PathBuf::from("/shared"),
        };
        let catalog = ProfileCatalog::builtin();

        assert_eq!(layout.staged_source("abc"), PathBuf::from("/mpc/src/abc"));
        assert_eq!(
            layout.encode_output("abc", catalog.get("720p").unwrap()),
            PathBuf::from("/shared/dst/abc_720p.mp4")
        );
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("WORKER_CONCURRENCY", "6");
        std::env::set_var("WORKER_ONESHOT", "true");
        std::env::set_var("WORKER_PROGRESS_INTERVAL_MS", "0");
        std::env::set_var("SLACK_WEBHOOK_URL", "");

        let config = WorkerConfig::from_env();
        assert_eq!(config.concurrency, 6);
        assert!(config.oneshot);
        assert_eq!(config.progress_interval, Duration::from_millis(2000));
        assert_eq!(config.slack_webhook_url, None);
        assert_eq!(config.work_dir, PathBuf::from("/mpc"));

        for var in [
            "WORKER_CONCURRENCY",
            "WORKER_ONESHOT",
            "WORKER_PROGRESS_INTERVAL_MS",
            "SLACK_WEBHOOK_URL",
        ] {
            std::env::remove_var(var);
        }
        assert!(!WorkerConfig::from_env().oneshot);
    }

    #[test]
    fn test_queue_name_for_dedicated_pod() {
        let shared = WorkerConfig::default();
        assert_eq!(shared.queue_name(JobAction::Transcode).unwrap(), "transcode");
        assert!(!shared.is_dedicated());

        let dedicated = WorkerConfig {
            oneshot: true,
            job_name: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(dedicated.is_dedicated());
        assert_eq!(dedicated.queue_name(JobAction::Transcode).unwrap(), "transcode:abc");

        // Oneshot without a job name drains the shared queue
        let oneshot = WorkerConfig {
            oneshot: true,
            ..Default::default()
        };
        assert_eq!(oneshot.queue_name(JobAction::Download).unwrap(), "download");

        assert!(matches!(
            dedicated.queue_name(JobAction::Snippetize),
            Err(WorkerError::UnsupportedAction(_))
        ));
    }
}
