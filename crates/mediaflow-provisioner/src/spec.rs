//! Serde model of the `batch/v1` Job resource.
//!
//! Only the fields the provisioner sets or reads back are modelled. Every
//! field defaults so API responses with extra or missing fields still parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: JobSpec,
}

impl BatchJob {
    /// The single worker container.
    pub fn container(&self) -> Option<&Container> {
        self.spec.template.spec.containers.first()
    }

    pub fn container_mut(&mut self) -> Option<&mut Container> {
        self.spec.template.spec.containers.first_mut()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completions: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,
    #[serde(default)]
    pub template: PodTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolumeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyDirVolumeSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSource {
    pub claim_name: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    /// Value of the env var `name`, if set.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    /// Set `name`, replacing an existing entry.
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.env.iter_mut().find(|e| e.name == name) {
            Some(existing) => existing.value = value,
            None => self.env.push(EnvVar { name, value }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

/// CPU/memory quantities keyed by resource name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_api_response() {
        let raw = r#"{
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": "transcoder-abc-x7k2p",
                "generateName": "transcoder-abc-",
                "namespace": "jobs",
                "uid": "9f3c1a52-1b7e-4a8e-a0c2-5d1e2f3a4b5c",
                "resourceVersion": "123456",
                "labels": {"job": "transcode"}
            },
            "spec": {"parallelism": 1, "backoffLimit": 1, "ttlSecondsAfterFinished": 0,
                     "template": {"spec": {"containers": [{"name": "transcode", "image": "worker:1"}]}}},
            "status": {}
        }"#;

        let job: BatchJob = serde_json::from_str(raw).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("transcoder-abc-x7k2p"));
        assert_eq!(job.metadata.uid.as_deref(), Some("9f3c1a52-1b7e-4a8e-a0c2-5d1e2f3a4b5c"));
        assert_eq!(job.spec.ttl_seconds_after_finished, Some(0));
        assert_eq!(job.container().unwrap().image, "worker:1");
    }

    #[test]
    fn test_serializes_camel_case() {
        let spec = JobSpec {
            backoff_limit: Some(1),
            ttl_seconds_after_finished: Some(0),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["backoffLimit"], 1);
        assert_eq!(json["ttlSecondsAfterFinished"], 0);
        assert!(json.get("parallelism").is_none());
    }

    #[test]
    fn test_set_env_replaces() {
        let mut container = Container::default();
        container.set_env("JOB_NAME", "transcode");
        container.set_env("JOB_NAME", "abc");
        assert_eq!(container.env.len(), 1);
        assert_eq!(container.env_value("JOB_NAME"), Some("abc"));
    }
}
