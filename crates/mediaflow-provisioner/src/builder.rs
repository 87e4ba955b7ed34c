//! Option-based construction of worker job specifications.
//!
//! A base template with safe defaults is built once and a typed list of
//! [`JobOption`]s is applied to it in order. Environment variables are sorted
//! by name afterwards so identical inputs always give identical specs.

use std::collections::BTreeMap;

use crate::error::{ProvisionError, ProvisionResult};
use crate::spec::{
    BatchJob, Container, EmptyDirVolumeSource, EnvVar, JobSpec, ObjectMeta,
    PersistentVolumeClaimSource, PodSpec, PodTemplateSpec, ResourceRequirements, Volume,
    VolumeMount,
};

pub const DEFAULT_IMAGE: &str = "gcr.io/mediaflow/worker:latest";
pub const DEFAULT_NAMESPACE: &str = "jobs";
pub const DEFAULT_JOB_NAME: &str = "transcode";
pub const DEFAULT_ROLE: &str = "transcoder";
pub const DEFAULT_PVC_NAME: &str = "mpc-storage-std-claim";
pub const DEFAULT_CREDENTIALS_PATH: &str = "/google-cloud.json";
pub const SHARED_MOUNT_PATH: &str = "/mpc";
pub const DEFAULT_CPU: &str = "750m";
pub const DEFAULT_MEMORY: &str = "2000M";

/// Longest `generateName` prefix the API accepts before its random suffix.
const MAX_GENERATE_NAME: usize = 58;

/// CPU and memory request/limit pairs for a worker job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTier {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl Default for ResourceTier {
    fn default() -> Self {
        Self {
            cpu_request: DEFAULT_CPU.to_string(),
            cpu_limit: DEFAULT_CPU.to_string(),
            memory_request: DEFAULT_MEMORY.to_string(),
            memory_limit: DEFAULT_MEMORY.to_string(),
        }
    }
}

impl ResourceTier {
    /// Create tier from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str, default: String| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(default)
        };
        Self {
            cpu_request: var("PROVISION_CPU_REQUEST", defaults.cpu_request),
            cpu_limit: var("PROVISION_CPU_LIMIT", defaults.cpu_limit),
            memory_request: var("PROVISION_MEMORY_REQUEST", defaults.memory_request),
            memory_limit: var("PROVISION_MEMORY_LIMIT", defaults.memory_limit),
        }
    }

    /// Check every value is a well-formed resource quantity.
    pub fn validate(&self) -> ProvisionResult<()> {
        for (field, value) in [
            ("cpu_request", &self.cpu_request),
            ("cpu_limit", &self.cpu_limit),
            ("memory_request", &self.memory_request),
            ("memory_limit", &self.memory_limit),
        ] {
            if !is_quantity(value) {
                return Err(ProvisionError::invalid_spec(format!(
                    "{} is not a resource quantity: '{}'",
                    field, value
                )));
            }
        }
        Ok(())
    }
}

/// One mutation of the base template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOption {
    Image(String),
    /// Worker role passed as the container's first argument
    WorkerRole(String),
    /// Name prefix; the API appends a random suffix
    GenerateName(String),
    Namespace(String),
    JobNameEnv(String),
    Env { name: String, value: String },
    TtlAfterFinished(i32),
    Parallelism(i32),
    BackoffLimit(i32),
    ResourceRequests { cpu: String, memory: String },
    ResourceLimits { cpu: String, memory: String },
}

impl JobOption {
    fn apply(self, job: &mut BatchJob) {
        match self {
            JobOption::GenerateName(name) => {
                job.metadata.generate_name = Some(generate_name(&name));
                return;
            }
            JobOption::Namespace(namespace) => {
                job.metadata.namespace = Some(namespace);
                return;
            }
            JobOption::TtlAfterFinished(secs) => {
                job.spec.ttl_seconds_after_finished = Some(secs);
                return;
            }
            JobOption::Parallelism(n) => {
                job.spec.parallelism = Some(n);
                return;
            }
            JobOption::BackoffLimit(n) => {
                job.spec.backoff_limit = Some(n);
                return;
            }
            _ => {}
        }

        let Some(container) = job.container_mut() else {
            return;
        };
        match self {
            JobOption::Image(image) => container.image = image,
            JobOption::WorkerRole(role) => container.args = vec![role],
            JobOption::JobNameEnv(name) => container.set_env("JOB_NAME", name),
            JobOption::Env { name, value } => container.set_env(name, value),
            JobOption::ResourceRequests { cpu, memory } => {
                container.resources.requests = resource_map(cpu, memory);
            }
            JobOption::ResourceLimits { cpu, memory } => {
                container.resources.limits = resource_map(cpu, memory);
            }
            JobOption::GenerateName(_)
            | JobOption::Namespace(_)
            | JobOption::TtlAfterFinished(_)
            | JobOption::Parallelism(_)
            | JobOption::BackoffLimit(_) => {}
        }
    }
}

fn resource_map(cpu: String, memory: String) -> BTreeMap<String, String> {
    BTreeMap::from([("cpu".to_string(), cpu), ("memory".to_string(), memory)])
}

/// Base worker job template.
pub fn base_job() -> BatchJob {
    let tier = ResourceTier::default();

    BatchJob {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", DEFAULT_JOB_NAME)),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            labels: BTreeMap::from([("job".to_string(), DEFAULT_JOB_NAME.to_string())]),
            ..Default::default()
        },
        spec: JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: BTreeMap::from([("job".to_string(), DEFAULT_JOB_NAME.to_string())]),
                    ..Default::default()
                }),
                spec: PodSpec {
                    service_account_name: Some("default".to_string()),
                    restart_policy: Some("Never".to_string()),
                    volumes: vec![
                        Volume {
                            name: "transcode".to_string(),
                            empty_dir: Some(EmptyDirVolumeSource {
                                medium: Some("Memory".to_string()),
                            }),
                            persistent_volume_claim: None,
                        },
                        Volume {
                            name: "mpc-storage-std".to_string(),
                            empty_dir: None,
                            persistent_volume_claim: Some(PersistentVolumeClaimSource {
                                claim_name: DEFAULT_PVC_NAME.to_string(),
                                read_only: false,
                            }),
                        },
                    ],
                    containers: vec![Container {
                        name: DEFAULT_JOB_NAME.to_string(),
                        image: DEFAULT_IMAGE.to_string(),
                        image_pull_policy: Some("Always".to_string()),
                        args: vec![DEFAULT_ROLE.to_string()],
                        env: vec![
                            EnvVar {
                                name: "JOB_NAME".to_string(),
                                value: DEFAULT_JOB_NAME.to_string(),
                            },
                            EnvVar {
                                name: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                                value: DEFAULT_CREDENTIALS_PATH.to_string(),
                            },
                        ],
                        volume_mounts: vec![VolumeMount {
                            name: "mpc-storage-std".to_string(),
                            mount_path: SHARED_MOUNT_PATH.to_string(),
                        }],
                        resources: ResourceRequirements {
                            limits: resource_map(tier.cpu_limit, tier.memory_limit),
                            requests: resource_map(tier.cpu_request, tier.memory_request),
                        },
                    }],
                },
            },
            ..Default::default()
        },
    }
}

/// Apply `options` in order to the base template.
pub fn build_job(options: impl IntoIterator<Item = JobOption>) -> BatchJob {
    let mut job = base_job();
    for option in options {
        option.apply(&mut job);
    }
    if let Some(container) = job.container_mut() {
        container.env.sort_by(|a, b| a.name.cmp(&b.name));
    }
    job
}

/// DNS-1123 label prefix ending in `-`.
fn generate_name(raw: &str) -> String {
    let mut name: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();

    name.truncate(MAX_GENERATE_NAME - 1);
    let trimmed = name.trim_matches('-');
    if trimmed.is_empty() {
        format!("{}-", DEFAULT_JOB_NAME)
    } else {
        format!("{}-", trimmed)
    }
}

/// Digits with an optional fraction and an optional unit suffix.
fn is_quantity(value: &str) -> bool {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
    ];

    let number = SUFFIXES
        .iter()
        .find_map(|s| value.strip_suffix(s))
        .unwrap_or(value);

    let mut parts = number.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();

    !whole.is_empty()
        && whole.bytes().all(|b| b.is_ascii_digit())
        && fraction.map_or(true, |f| !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()))
}
