//! Firestore REST API client.
//!
//! Production-grade client with:
//! - Token caching with refresh margin
//! - HTTP client tuning (pooling, timeouts)
//! - Exponential backoff with jitter
//! - Observability (tracing spans, metrics)

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{info_span, Instrument};

use crate::error::{StoreError, StoreResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::token_cache::{TokenCache, FIRESTORE_SCOPE};
use crate::types::{
    Aggregation, BatchGetDocumentsRequest, BatchGetDocumentsResponse, CommitRequest,
    CommitResponse, Document, DocumentMask, FieldTransform, FromFirestoreValue,
    RunAggregationQueryRequest, RunAggregationQueryResponseItem, RunQueryRequest,
    RunQueryResponseItem, StructuredAggregationQuery, StructuredQuery, Value, Write,
};

const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com/v1";

// =============================================================================
// Configuration
// =============================================================================

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    /// GCP project ID
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    /// REST endpoint root, without the `/projects/...` suffix
    pub endpoint: String,
    /// Emulator mode: plain HTTP, no credentials
    pub emulator: bool,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map_err(|_| {
                StoreError::config_error(
                    "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
                )
            })?;

        if project_id.is_empty() {
            return Err(StoreError::config_error(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID cannot be empty",
            ));
        }

        let connect_timeout_secs: u64 = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5);

        let emulator_host = std::env::var("FIRESTORE_EMULATOR_HOST")
            .ok()
            .filter(|h| !h.is_empty());

        let endpoint = match &emulator_host {
            Some(host) => format!("http://{}/v1", host),
            None => DEFAULT_ENDPOINT.to_string(),
        };

        Ok(Self {
            project_id,
            database_id: std::env::var("FIRESTORE_DATABASE_ID")
                .unwrap_or_else(|_| "(default)".to_string()),
            endpoint,
            emulator: emulator_host.is_some(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            retry: RetryConfig::from_env(),
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Firestore REST API client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Option<Arc<TokenCache>>,
}

impl FirestoreClient {
    /// Create a client, loading service account credentials unless the
    /// config points at the emulator.
    pub fn new(config: FirestoreConfig) -> StoreResult<Self> {
        let token_cache = if config.emulator {
            None
        } else {
            Some(Arc::new(TokenCache::from_service_account_env(&[
                FIRESTORE_SCOPE,
            ])?))
        };
        Self::with_token_cache(config, token_cache)
    }

    /// Create a client with an explicit token cache (`None` sends no auth).
    pub fn with_token_cache(
        config: FirestoreConfig,
        token_cache: Option<Arc<TokenCache>>,
    ) -> StoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("mediaflow-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StoreError::Network)?;

        let base_url = format!(
            "{}/projects/{}/databases/{}/documents",
            config.endpoint.trim_end_matches('/'),
            config.project_id,
            config.database_id
        );

        Ok(Self {
            http,
            config,
            base_url,
            token_cache,
        })
    }

    pub fn from_env() -> StoreResult<Self> {
        Self::new(FirestoreConfig::from_env()?)
    }

    fn document_path(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, doc_id)
    }

    /// Resource name used inside request bodies.
    pub fn full_document_name(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "projects/{}/databases/{}/documents/{}/{}",
            self.config.project_id, self.config.database_id, collection, doc_id
        )
    }

    // =========================================================================
    // Document Operations
    // =========================================================================

    /// Get a document. `None` when it does not exist.
    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &str,
    ) -> StoreResult<Option<Document>> {
        let url = self.document_path(collection, doc_id);

        self.execute_request("get_document", collection, Some(doc_id), || async {
            let response = self.send(|http| http.get(&url)).await?;
            match response.status() {
                StatusCode::OK => Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => Ok(None),
                status => Err(Self::error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Create a document with a caller-chosen id.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
    ) -> StoreResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(fields);

        self.execute_request("create_document", collection, Some(doc_id), || async {
            let response = self.send(|http| http.post(&url).json(&body)).await?;
            match response.status() {
                StatusCode::OK | StatusCode::CREATED => Ok(response.json().await?),
                StatusCode::CONFLICT => Err(StoreError::AlreadyExists(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                status => Err(Self::error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Patch the masked fields of an existing document.
    ///
    /// The write is conditional on the document existing, so a missing
    /// document yields `NotFound` instead of an upsert.
    pub async fn update_document(
        &self,
        collection: &str,
        doc_id: &str,
        fields: HashMap<String, Value>,
        update_mask: &[&str],
    ) -> StoreResult<Document> {
        let mut params: Vec<String> = update_mask
            .iter()
            .map(|f| format!("updateMask.fieldPaths={}", urlencoding::encode(f)))
            .collect();
        params.push("currentDocument.exists=true".to_string());
        let url = format!(
            "{}?{}",
            self.document_path(collection, doc_id),
            params.join("&")
        );
        let body = Document::new(fields);

        self.execute_request("update_document", collection, Some(doc_id), || async {
            let response = self.send(|http| http.patch(&url).json(&body)).await?;
            match response.status() {
                StatusCode::OK => Ok(response.json().await?),
                StatusCode::NOT_FOUND => Err(StoreError::not_found(format!(
                    "{}/{}",
                    collection, doc_id
                ))),
                status => Err(Self::error_response(status, &url, response).await),
            }
        })
        .await
    }

    /// Fetch several documents in one round trip. Missing documents are omitted.
    pub async fn batch_get_documents(
        &self,
        full_document_names: Vec<String>,
    ) -> StoreResult<Vec<Document>> {
        if full_document_names.is_empty() {
            return Ok(vec![]);
        }
        if full_document_names.len() > 100 {
            return Err(StoreError::request_failed(
                "Batch get exceeds 100 document limit",
            ));
        }

        let url = format!("{}:batchGet", self.base_url);
        let request = BatchGetDocumentsRequest {
            documents: full_document_names,
        };

        self.execute_request("batch_get_documents", "batch", None, || async {
            let response = self.send(|http| http.post(&url).json(&request)).await?;
            let items: Vec<BatchGetDocumentsResponse> =
                Self::parse_ok(response, &url, "batchGet").await?;
            Ok(items.into_iter().filter_map(|r| r.found).collect())
        })
        .await
    }

    // =========================================================================
    // Query Operations
    // =========================================================================

    /// Run a structured query against top-level collections.
    pub async fn run_query(&self, query: StructuredQuery) -> StoreResult<Vec<Document>> {
        let url = format!("{}:runQuery", self.base_url);
        let collection = query
            .from
            .first()
            .map(|c| c.collection_id.clone())
            .unwrap_or_default();
        let request = RunQueryRequest {
            structured_query: query,
        };

        self.execute_request("run_query", &collection, None, || async {
            let response = self.send(|http| http.post(&url).json(&request)).await?;
            let items: Vec<RunQueryResponseItem> =
                Self::parse_ok(response, &url, "runQuery").await?;
            Ok(items.into_iter().filter_map(|r| r.document).collect())
        })
        .await
    }

    /// Count the documents matching `query` server-side.
    pub async fn run_count_query(&self, query: StructuredQuery) -> StoreResult<u64> {
        const ALIAS: &str = "total";

        let url = format!("{}:runAggregationQuery", self.base_url);
        let collection = query
            .from
            .first()
            .map(|c| c.collection_id.clone())
            .unwrap_or_default();
        let request = RunAggregationQueryRequest {
            structured_aggregation_query: StructuredAggregationQuery {
                structured_query: query,
                aggregations: vec![Aggregation::count(ALIAS)],
            },
        };

        self.execute_request("run_count_query", &collection, None, || async {
            let response = self.send(|http| http.post(&url).json(&request)).await?;
            let items: Vec<RunAggregationQueryResponseItem> =
                Self::parse_ok(response, &url, "runAggregationQuery").await?;

            items
                .iter()
                .filter_map(|item| item.result.as_ref())
                .filter_map(|r| r.aggregate_fields.as_ref())
                .find_map(|fields| fields.get(ALIAS))
                .and_then(u64::from_firestore_value)
                .ok_or_else(|| StoreError::invalid_response("aggregation result missing count"))
        })
        .await
    }

    /// Atomically increment `{collection}/{doc_id}.value` and return the new value.
    ///
    /// The counter document is created on first use.
    pub async fn increment_counter(&self, collection: &str, doc_id: &str) -> StoreResult<i64> {
        let url = format!("{}:commit", self.base_url);
        let mut target = Document::new(HashMap::new());
        target.name = Some(self.full_document_name(collection, doc_id));

        let request = CommitRequest {
            writes: vec![Write {
                update: Some(target),
                update_mask: Some(DocumentMask {
                    field_paths: vec![],
                }),
                update_transforms: vec![FieldTransform {
                    field_path: "value".to_string(),
                    increment: Value::IntegerValue("1".to_string()),
                }],
            }],
        };

        self.execute_request("increment_counter", collection, Some(doc_id), || async {
            let response = self.send(|http| http.post(&url).json(&request)).await?;
            let commit: CommitResponse = Self::parse_ok(response, &url, "commit").await?;

            commit
                .write_results
                .as_ref()
                .and_then(|results| results.first())
                .and_then(|r| r.transform_results.as_ref())
                .and_then(|t| t.first())
                .and_then(i64::from_firestore_value)
                .ok_or_else(|| StoreError::invalid_response("commit returned no transform result"))
        })
        .await
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn is_access_token_expired(body: &str) -> bool {
        body.contains("ACCESS_TOKEN_EXPIRED") || body.contains("\"UNAUTHENTICATED\"")
    }

    async fn authorize(&self, request: RequestBuilder) -> StoreResult<RequestBuilder> {
        match &self.token_cache {
            Some(cache) => Ok(request.bearer_auth(cache.get_token().await?)),
            None => Ok(request),
        }
    }

    /// Send a request, refreshing the token once if the server reports it expired.
    async fn send<F>(&self, build: F) -> StoreResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.authorize(build(&self.http)).await?.send().await?;

        let Some(cache) = &self.token_cache else {
            return Ok(response);
        };
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if !Self::is_access_token_expired(&body) {
            return Err(StoreError::from_http_status(401, body));
        }

        cache.invalidate().await;
        Ok(self.authorize(build(&self.http)).await?.send().await?)
    }

    /// Decode a 200 body, mapping any other status to an error.
    async fn parse_ok<T: DeserializeOwned>(
        response: Response,
        url: &str,
        what: &str,
    ) -> StoreResult<T> {
        let status = response.status();
        if status != StatusCode::OK {
            return Err(Self::error_response(status, url, response).await);
        }

        let body = response.text().await.unwrap_or_default();
        serde_json::from_str(&body).map_err(|e| {
            StoreError::invalid_response(format!(
                "Failed to parse {} response: {} (body prefix: {})",
                what,
                e,
                &body[..body.len().min(200)]
            ))
        })
    }

    /// Execute a request with retry, tracing and metrics.
    async fn execute_request<T, F, Fut>(
        &self,
        operation: &str,
        collection: &str,
        doc_id: Option<&str>,
        op: F,
    ) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let span = match doc_id {
            Some(id) => {
                info_span!("firestore_request", operation = %operation, collection = %collection, doc_id = %id)
            }
            None => info_span!("firestore_request", operation = %operation, collection = %collection),
        };

        let start = Instant::now();
        let result = with_retry(&self.config.retry, operation, op)
            .instrument(span)
            .await;
        let latency_ms = start.elapsed().as_millis() as f64;

        let status = match &result {
            Ok(_) => 200,
            Err(e) => e.http_status().unwrap_or(500),
        };
        record_request(operation, status, latency_ms);

        result
    }

    async fn error_response(status: StatusCode, url: &str, response: Response) -> StoreError {
        let body = response.text().await.unwrap_or_default();
        StoreError::from_http_status(status.as_u16(), format!("{} failed: {}", url, body))
    }
}
