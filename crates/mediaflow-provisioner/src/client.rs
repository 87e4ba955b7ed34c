//! Cluster job submission.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Certificate;
use serde::Deserialize;
use tracing::{debug, info_span, Instrument};

use crate::error::{ProvisionError, ProvisionResult};
use crate::spec::BatchJob;

/// Service account mount inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Submits job specifications to the orchestrator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create `job` in `namespace`, returning the accepted resource.
    async fn create_job(&self, namespace: &str, job: &BatchJob) -> ProvisionResult<BatchJob>;
}

/// `Status` body returned by the API server on errors.
#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// Kubernetes API client authenticated with the pod's service account.
#[derive(Clone)]
pub struct InClusterClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl InClusterClient {
    /// Client for the API server this pod runs under.
    pub async fn from_env() -> ProvisionResult<Self> {
        Self::from_service_account(Path::new(SERVICE_ACCOUNT_DIR)).await
    }

    /// Like [`from_env`](Self::from_env) with the service account files under `dir`.
    pub async fn from_service_account(dir: &Path) -> ProvisionResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ProvisionError::credentials("KUBERNETES_SERVICE_HOST not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| ProvisionError::credentials("KUBERNETES_SERVICE_PORT not set"))?;

        let token_path = dir.join("token");
        let token = read_credential(&token_path).await?;
        let token = String::from_utf8_lossy(&token).trim().to_string();
        if token.is_empty() {
            return Err(ProvisionError::credentials(format!(
                "{} is empty",
                token_path.display()
            )));
        }

        let ca = read_credential(&dir.join("ca.crt")).await?;
        let certificate = Certificate::from_pem(&ca)
            .map_err(|e| ProvisionError::credentials(format!("invalid cluster CA: {}", e)))?;

        let http = reqwest::Client::builder()
            .add_root_certificate(certificate)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: api_server_url(&host, &port),
            token,
        })
    }

    /// Client for an explicit API server URL.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> ProvisionResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn jobs_url(&self, namespace: &str) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.base_url, namespace)
    }
}

async fn read_credential(path: &Path) -> ProvisionResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| ProvisionError::credentials(format!("{}: {}", path.display(), e)))
}

fn api_server_url(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

#[async_trait]
impl ClusterClient for InClusterClient {
    async fn create_job(&self, namespace: &str, job: &BatchJob) -> ProvisionResult<BatchJob> {
        let url = self.jobs_url(namespace);
        let span = info_span!("cluster_create_job", namespace = %namespace);

        async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.token)
                .json(job)
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;
            debug!(status = status.as_u16(), "Cluster API response");

            if !status.is_success() {
                let message = serde_json::from_str::<ApiStatus>(&body)
                    .map(|s| s.message)
                    .ok()
                    .filter(|m| !m.is_empty())
                    .unwrap_or(body);
                return Err(ProvisionError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            Ok(serde_json::from_str(&body)?)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_job;
    use serial_test::serial;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_create_job_posts_spec() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/apis/batch/v1/namespaces/jobs/jobs"))
            .and(header("authorization", "Bearer sa-token"))
            .and(body_partial_json(serde_json::json!({
                "apiVersion": "batch/v1",
                "kind": "Job"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": {"name": "transcode-x1y2z", "namespace": "jobs", "uid": "u-1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = InClusterClient::new(server.uri(), "sa-token").unwrap();
        let created = client.create_job("jobs", &build_job([])).await.unwrap();
        assert_eq!(created.metadata.name.as_deref(), Some("transcode-x1y2z"));
        assert_eq!(created.metadata.uid.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_rejection_carries_status_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "kind": "Status",
                "message": "jobs.batch is forbidden",
                "code": 403
            })))
            .mount(&server)
            .await;

        let client = InClusterClient::new(server.uri(), "sa-token").unwrap();
        let err = client.create_job("jobs", &build_job([])).await.unwrap_err();
        match err {
            ProvisionError::Rejected { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "jobs.batch is forbidden");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_server_url() {
        assert_eq!(api_server_url("10.0.0.1", "443"), "https://10.0.0.1:443");
        assert_eq!(api_server_url("fd00::1", "443"), "https://[fd00::1]:443");
    }

    #[tokio::test]
    #[serial]
    async fn test_missing_credentials() {
        std::env::remove_var("KUBERNETES_SERVICE_HOST");
        let err = InClusterClient::from_env().await.err().unwrap();
        assert!(matches!(err, ProvisionError::Credentials(_)));

        std::env::set_var("KUBERNETES_SERVICE_HOST", "10.0.0.1");
        std::env::set_var("KUBERNETES_SERVICE_PORT", "443");
        let dir = tempfile::tempdir().unwrap();
        let err = InClusterClient::from_service_account(dir.path())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProvisionError::Credentials(_)));

        std::env::remove_var("KUBERNETES_SERVICE_HOST");
        std::env::remove_var("KUBERNETES_SERVICE_PORT");
    }
}
