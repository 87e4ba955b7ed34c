//! Dispatcher configuration.

use std::time::Duration;

/// Default Pub/Sub REST endpoint.
pub const PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Pub/Sub subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    pub project_id: String,
    pub subscription: String,
    /// REST endpoint; the emulator host when one is configured
    pub endpoint: String,
    /// Emulator in use; requests carry no credentials
    pub emulator: bool,
    /// Messages requested per pull
    pub max_messages: u32,
    /// HTTP timeout for one pull
    pub pull_timeout: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            subscription: "c24-transcode-jobs-sub".to_string(),
            endpoint: PUBSUB_ENDPOINT.to_string(),
            emulator: false,
            max_messages: 10,
            pull_timeout: Duration::from_secs(60),
        }
    }
}

impl PubSubConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let emulator_host = std::env::var("PUBSUB_EMULATOR_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty());

        Self {
            project_id: std::env::var("PUBSUB_PROJECT_ID")
                .or_else(|_| std::env::var("GCP_PROJECT_ID"))
                .unwrap_or(defaults.project_id),
            subscription: std::env::var("PUBSUB_SUBSCRIPTION").unwrap_or(defaults.subscription),
            endpoint: emulator_host
                .as_deref()
                .map(emulator_endpoint)
                .unwrap_or(defaults.endpoint),
            emulator: emulator_host.is_some(),
            max_messages: std::env::var("PUBSUB_MAX_MESSAGES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_messages),
            pull_timeout: defaults.pull_timeout,
        }
    }

    /// Fully qualified subscription name.
    pub fn subscription_path(&self) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            self.project_id, self.subscription
        )
    }
}

fn emulator_endpoint(host: &str) -> String {
    let host = host.trim();
    if host.starts_with("http://") || host.starts_with("https://") {
        host.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", host.trim_end_matches('/'))
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub pubsub: PubSubConfig,
    /// Requests routed in parallel per pull batch
    pub concurrency: usize,
    /// Wait after a failed or empty pull
    pub idle_backoff: Duration,
    /// Prometheus listener port; 0 disables the exporter
    pub metrics_port: u16,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pubsub: PubSubConfig::default(),
            concurrency: 8,
            idle_backoff: Duration::from_secs(1),
            metrics_port: 9091,
        }
    }
}

impl DispatcherConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pubsub: PubSubConfig::from_env(),
            concurrency: std::env::var("DISPATCHER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.concurrency),
            idle_backoff: std::env::var("DISPATCHER_IDLE_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_backoff),
            metrics_port: std::env::var("METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.metrics_port),
        }
    }
}
