//! Elastic worker provisioning.

use std::sync::Arc;

use tracing::{info, warn};

use mediaflow_models::JobAction;

use crate::builder::{build_job, JobOption, ResourceTier, DEFAULT_IMAGE, DEFAULT_NAMESPACE};
use crate::client::ClusterClient;
use crate::error::{ProvisionError, ProvisionResult};
use crate::spec::BatchJob;

/// Provisioner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Submit dedicated jobs at all
    pub enabled: bool,
    /// Worker container image
    pub image: String,
    pub namespace: String,
    pub parallelism: i32,
    /// Pod retries before the job is marked failed
    pub backoff_limit: i32,
    /// Seconds a finished job is kept before garbage collection
    pub ttl_after_finished: i32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: DEFAULT_IMAGE.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            parallelism: 1,
            backoff_limit: 1,
            ttl_after_finished: 0,
        }
    }
}

impl ProvisionerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("PROVISIONING_ENABLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.enabled),
            image: std::env::var("WORKER_IMAGE").unwrap_or(defaults.image),
            namespace: std::env::var("PROVISION_NAMESPACE").unwrap_or(defaults.namespace),
            parallelism: std::env::var("PROVISION_PARALLELISM")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.parallelism),
            backoff_limit: std::env::var("PROVISION_BACKOFF_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.backoff_limit),
            ttl_after_finished: std::env::var("PROVISION_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.ttl_after_finished),
        }
    }
}

/// Handle for a submitted worker job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedJob {
    pub name: String,
    pub namespace: String,
    pub uid: Option<String>,
}

/// Builds and submits dedicated worker jobs.
pub struct Provisioner {
    client: Arc<dyn ClusterClient>,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(client: Arc<dyn ClusterClient>, config: ProvisionerConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Job specification for one work item.
    ///
    /// The spec depends only on the inputs; `job_id` shows up in the name
    /// prefix and the `JOB_NAME` variable.
    pub fn job_spec(
        &self,
        job_id: &str,
        action: JobAction,
        tier: &ResourceTier,
    ) -> ProvisionResult<BatchJob> {
        let role = action
            .worker_role()
            .ok_or_else(|| ProvisionError::UnsupportedAction(action.to_string()))?;
        tier.validate()?;

        Ok(build_job([
            JobOption::Namespace(self.config.namespace.clone()),
            JobOption::Image(self.config.image.clone()),
            JobOption::WorkerRole(role.to_string()),
            JobOption::GenerateName(format!("{}-{}", role, job_id)),
            JobOption::JobNameEnv(job_id.to_string()),
            JobOption::Env {
                name: "WORKER_ONESHOT".to_string(),
                value: "true".to_string(),
            },
            JobOption::Parallelism(self.config.parallelism),
            JobOption::BackoffLimit(self.config.backoff_limit),
            JobOption::TtlAfterFinished(self.config.ttl_after_finished),
            JobOption::ResourceLimits {
                cpu: tier.cpu_limit.clone(),
                memory: tier.memory_limit.clone(),
            },
            JobOption::ResourceRequests {
                cpu: tier.cpu_request.clone(),
                memory: tier.memory_request.clone(),
            },
        ]))
    }

    /// Submit a dedicated worker for `job_id`.
    pub async fn provision(
        &self,
        job_id: &str,
        action: JobAction,
        tier: &ResourceTier,
    ) -> ProvisionResult<ProvisionedJob> {
        let spec = self.job_spec(job_id, action, tier)?;

        let created = match self.client.create_job(&self.config.namespace, &spec).await {
            Ok(created) => created,
            Err(e) => {
                metrics::counter!("mediaflow_provision_total", "outcome" => "failure").increment(1);
                warn!(job_id = %job_id, action = %action, "Worker job submission failed: {}", e);
                return Err(e);
            }
        };
        metrics::counter!("mediaflow_provision_total", "outcome" => "success").increment(1);

        let handle = ProvisionedJob {
            name: created
                .metadata
                .name
                .or(spec.metadata.generate_name)
                .unwrap_or_default(),
            namespace: created
                .metadata
                .namespace
                .unwrap_or_else(|| self.config.namespace.clone()),
            uid: created.metadata.uid,
        };

        info!(
            job_id = %job_id,
            action = %action,
            name = %handle.name,
            namespace = %handle.namespace,
            "Provisioned worker job"
        );
        Ok(handle)
    }
}
