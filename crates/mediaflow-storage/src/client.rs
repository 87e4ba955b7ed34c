//! S3-compatible object storage client.
//!
//! `s3://` locations use the ambient AWS credential chain. `gs://` locations
//! go through the GCS XML interoperability endpoint with HMAC keys, which
//! speaks the S3 API.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::location::StorageLocation;
use crate::transfer::StorageTransfer;

/// Default GCS interoperability endpoint.
pub const GCS_ENDPOINT: &str = "https://storage.googleapis.com";

/// Configuration for the object storage client.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Enable the `s3://` backend
    pub s3_enabled: bool,
    /// Override for S3-compatible endpoints (MinIO, localstack)
    pub s3_endpoint: Option<String>,
    /// GCS interoperability endpoint
    pub gcs_endpoint: Option<String>,
    /// GCS HMAC access key
    pub gcs_access_key: Option<String>,
    /// GCS HMAC secret
    pub gcs_secret: Option<String>,
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            s3_enabled: std::env::var("STORAGE_S3_ENABLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(true),
            s3_endpoint: non_empty("S3_ENDPOINT_URL"),
            gcs_endpoint: non_empty("STORAGE_GCS_ENDPOINT"),
            gcs_access_key: non_empty("STORAGE_GCS_HMAC_ACCESS_KEY"),
            gcs_secret: non_empty("STORAGE_GCS_HMAC_SECRET"),
        }
    }

    fn gcs_credentials(&self) -> Option<Credentials> {
        match (&self.gcs_access_key, &self.gcs_secret) {
            (Some(key), Some(secret)) => Some(Credentials::new(key, secret, None, None, "gcs-hmac")),
            _ => None,
        }
    }
}

/// Transfers between local paths and S3/GCS buckets.
#[derive(Clone, Default)]
pub struct ObjectStoreClient {
    s3: Option<Client>,
    gcs: Option<Client>,
}

impl ObjectStoreClient {
    /// Create a client from configuration.
    ///
    /// Backends without credentials are left unconfigured; transfers that
    /// need them fail with a config error.
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        let s3 = if config.s3_enabled {
            let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
            Some(s3_client(&shared, config.s3_endpoint.as_deref()))
        } else {
            None
        };

        let gcs = config.gcs_credentials().map(|credentials| {
            let endpoint = config.gcs_endpoint.as_deref().unwrap_or(GCS_ENDPOINT);
            let sdk_config = Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .endpoint_url(endpoint)
                .region(Region::new("auto"))
                .credentials_provider(credentials)
                .force_path_style(true)
                .build();
            Client::from_conf(sdk_config)
        });

        info!(
            s3 = s3.is_some(),
            gcs = gcs.is_some(),
            "Object storage client configured"
        );
        Ok(Self { s3, gcs })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        Self::new(StorageConfig::from_env()).await
    }

    /// Client that only handles local paths.
    pub fn local_only() -> Self {
        Self::default()
    }

    fn client_for(&self, location: &StorageLocation) -> StorageResult<&Client> {
        let client = match location {
            StorageLocation::S3 { .. } => self.s3.as_ref(),
            StorageLocation::Gcs { .. } => self.gcs.as_ref(),
            StorageLocation::Local(_) => None,
        };
        client.ok_or_else(|| {
            StorageError::config_error(format!(
                "no {} credentials configured for {}",
                location.backend(),
                location
            ))
        })
    }

    /// Stream an object into `path`.
    ///
    /// Bytes land in a sibling `.part` file that is renamed into place once
    /// complete, so `path` never holds a truncated object.
    async fn download_object(
        &self,
        client: &Client,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> StorageResult<u64> {
        debug!("Downloading {}/{} to {}", bucket, key, path.display());

        let response = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("{:?}", e);
                if message.contains("NoSuchKey") || message.contains("NotFound") {
                    StorageError::not_found(format!("{}/{}", bucket, key))
                } else {
                    StorageError::download_failed(format!("{}/{}: {}", bucket, key, e))
                }
            })?;

        ensure_parent(path).await?;
        let partial = partial_path(path);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut body = response.body;
        let mut written = 0u64;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, path).await?;
        Ok(written)
    }

    async fn upload_object(
        &self,
        client: &Client,
        path: &Path,
        bucket: &str,
        key: &str,
    ) -> StorageResult<u64> {
        debug!("Uploading {} to {}/{}", path.display(), bucket, key);

        let size = tokio::fs::metadata(path).await?.len();
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}/{}: {}", bucket, key, e)))?;

        Ok(size)
    }
}

fn s3_client(shared: &aws_types::SdkConfig, endpoint: Option<&str>) -> Client {
    let mut builder = aws_sdk_s3::config::Builder::from(shared);
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    Client::from_conf(builder.build())
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

async fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn copy_local(from: &Path, to: &Path) -> StorageResult<u64> {
    if !tokio::fs::try_exists(from).await? {
        return Err(StorageError::not_found(from.display().to_string()));
    }
    if from == to {
        return Ok(tokio::fs::metadata(from).await?.len());
    }
    ensure_parent(to).await?;
    Ok(tokio::fs::copy(from, to).await?)
}

fn record_transfer(direction: &'static str, backend: &'static str, started: Instant, result: &StorageResult<u64>) {
    let outcome = if result.is_ok() { "success" } else { "failure" };
    metrics::counter!(
        "mediaflow_storage_transfers_total",
        "direction" => direction,
        "backend" => backend,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "mediaflow_storage_transfer_duration_seconds",
        "direction" => direction,
        "backend" => backend
    )
    .record(started.elapsed().as_secs_f64());
    if let Ok(bytes) = result {
        metrics::counter!("mediaflow_storage_bytes_total", "direction" => direction).increment(*bytes);
    }
}

#[async_trait]
impl StorageTransfer for ObjectStoreClient {
    async fn download(&self, src: &str, local: &Path) -> StorageResult<()> {
        let location = StorageLocation::parse(src)?;
        let started = Instant::now();

        let result = match &location {
            StorageLocation::Local(from) => copy_local(from, local).await,
            StorageLocation::S3 { bucket, key } | StorageLocation::Gcs { bucket, key } => {
                let client = self.client_for(&location)?;
                self.download_object(client, bucket, key, local).await
            }
        };
        record_transfer("download", location.backend(), started, &result);

        let bytes = result?;
        info!(source = %location, path = %local.display(), bytes, "Downloaded");
        Ok(())
    }

    async fn upload(&self, local: &Path, dest: &str) -> StorageResult<()> {
        let location = StorageLocation::parse(dest)?;
        let started = Instant::now();

        let result = match &location {
            StorageLocation::Local(to) => copy_local(local, to).await,
            StorageLocation::S3 { bucket, key } | StorageLocation::Gcs { bucket, key } => {
                let client = self.client_for(&location)?;
                self.upload_object(client, local, bucket, key).await
            }
        };
        record_transfer("upload", location.backend(), started, &result);

        let bytes = result?;
        info!(path = %local.display(), destination = %location, bytes, "Uploaded");
        Ok(())
    }
}
