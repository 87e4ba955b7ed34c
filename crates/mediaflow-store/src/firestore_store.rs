//! Firestore-backed job store.
//!
//! Layout:
//! - `jobs/{guid}`: the job record, with `encode_data_id` linking its satellite
//! - `encode_data/{id}`: progress and diagnostic payload
//! - `counters/{jobs,encode_data}`: numeric id allocation

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use mediaflow_models::{EncodeData, Job, JobAction, JobGuid, JobStatus, NewJob, StatusCount};

use crate::client::FirestoreClient;
use crate::error::{StoreError, StoreResult};
use crate::repository::JobStore;
use crate::types::{Document, FromFirestoreValue, StructuredQuery, ToFirestoreValue, Value};

const JOBS: &str = "jobs";
const ENCODE_DATA: &str = "encode_data";
const COUNTERS: &str = "counters";

pub struct FirestoreJobStore {
    client: FirestoreClient,
}

impl FirestoreJobStore {
    pub fn new(client: FirestoreClient) -> Self {
        Self { client }
    }

    pub fn from_env() -> StoreResult<Self> {
        Ok(Self::new(FirestoreClient::from_env()?))
    }

    async fn load_encode_data(&self, id: i64) -> StoreResult<Option<EncodeData>> {
        let doc = self.client.get_document(ENCODE_DATA, &id.to_string()).await?;
        doc.map(|d| encode_data_from_document(&d)).transpose()
    }
}

fn job_fields(job: &Job) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("id".to_string(), job.id.to_firestore_value());
    fields.insert("guid".to_string(), job.guid.as_str().to_firestore_value());
    fields.insert("c24_job_id".to_string(), job.c24_job_id.to_firestore_value());
    fields.insert("profile".to_string(), job.profile.to_firestore_value());
    fields.insert("action".to_string(), job.action.as_str().to_firestore_value());
    fields.insert("source".to_string(), job.source.to_firestore_value());
    fields.insert("destination".to_string(), job.destination.to_firestore_value());
    fields.insert("status".to_string(), job.status.as_str().to_firestore_value());
    fields.insert("metadata".to_string(), job.metadata.to_firestore_value());
    fields.insert("callback".to_string(), job.callback.to_firestore_value());
    fields.insert("encode_data_id".to_string(), job.encode_data.id.to_firestore_value());
    fields.insert("created_at".to_string(), job.created_at.to_firestore_value());
    fields.insert("updated_at".to_string(), job.updated_at.to_firestore_value());
    fields
}

fn required<T: FromFirestoreValue>(doc: &Document, key: &str) -> StoreResult<T> {
    doc.get(key).ok_or_else(|| {
        StoreError::invalid_response(format!(
            "{} missing or malformed field `{}`",
            doc.name.as_deref().unwrap_or("document"),
            key
        ))
    })
}

fn job_from_document(doc: &Document) -> StoreResult<Job> {
    let id: i64 = required(doc, "id")?;
    let action: JobAction = required::<String>(doc, "action")?
        .parse()
        .map_err(|e| StoreError::invalid_response(format!("{}", e)))?;
    let status: JobStatus = required::<String>(doc, "status")?
        .parse()
        .map_err(|e| StoreError::invalid_response(format!("{}", e)))?;
    let encode_data_id: i64 = doc.get("encode_data_id").unwrap_or(0);
    let created_at: DateTime<Utc> = required(doc, "created_at")?;

    Ok(Job {
        id,
        guid: JobGuid::from_string(required::<String>(doc, "guid")?),
        c24_job_id: required(doc, "c24_job_id")?,
        profile: required(doc, "profile")?,
        action,
        source: required(doc, "source")?,
        destination: required(doc, "destination")?,
        status,
        metadata: doc.get("metadata").unwrap_or_default(),
        callback: doc.get("callback").unwrap_or_default(),
        encode_data: EncodeData::empty(encode_data_id, id),
        created_at,
        updated_at: doc.get("updated_at").unwrap_or(created_at),
    })
}

fn encode_data_fields(data: &EncodeData) -> HashMap<String, Value> {
    let mut fields = HashMap::new();
    fields.insert("id".to_string(), data.id.to_firestore_value());
    fields.insert("job_id".to_string(), data.job_id.to_firestore_value());
    fields.insert("progress".to_string(), data.progress.to_firestore_value());
    fields.insert("data".to_string(), data.data.to_firestore_value());
    fields
}

fn encode_data_from_document(doc: &Document) -> StoreResult<EncodeData> {
    Ok(EncodeData {
        id: required(doc, "id")?,
        job_id: required(doc, "job_id")?,
        progress: doc.get("progress").unwrap_or(0.0),
        data: doc.get("data").unwrap_or_else(|| "{}".to_string()),
    })
}

#[async_trait]
impl JobStore for FirestoreJobStore {
    async fn create_job(&self, new_job: NewJob) -> StoreResult<Job> {
        let id = self.client.increment_counter(COUNTERS, JOBS).await?;
        let job = new_job.into_job(id, 0, Utc::now());

        self.client
            .create_document(JOBS, job.guid.as_str(), job_fields(&job))
            .await?;

        debug!(guid = %job.guid, id, "Created job document");
        Ok(job)
    }

    async fn create_encode_data(&self, job: &Job) -> StoreResult<EncodeData> {
        let id = self.client.increment_counter(COUNTERS, ENCODE_DATA).await?;
        let data = EncodeData::empty(id, job.id);

        self.client
            .create_document(ENCODE_DATA, &id.to_string(), encode_data_fields(&data))
            .await?;

        let mut link = HashMap::new();
        link.insert("encode_data_id".to_string(), id.to_firestore_value());
        self.client
            .update_document(JOBS, job.guid.as_str(), link, &["encode_data_id"])
            .await?;

        Ok(data)
    }

    async fn get_job_by_guid(&self, guid: &JobGuid) -> StoreResult<Option<Job>> {
        let Some(doc) = self.client.get_document(JOBS, guid.as_str()).await? else {
            return Ok(None);
        };

        let mut job = job_from_document(&doc)?;
        if job.encode_data.id > 0 {
            match self.load_encode_data(job.encode_data.id).await? {
                Some(data) => job.encode_data = data,
                None => warn!(guid = %guid, encode_data_id = job.encode_data.id, "Encode data record missing"),
            }
        }
        Ok(Some(job))
    }

    async fn update_status(&self, guid: &JobGuid, status: JobStatus) -> StoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), status.as_str().to_firestore_value());
        fields.insert("updated_at".to_string(), Utc::now().to_firestore_value());

        self.client
            .update_document(JOBS, guid.as_str(), fields, &["status", "updated_at"])
            .await?;
        Ok(())
    }

    async fn update_encode_data(&self, id: i64, data: &str) -> StoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("data".to_string(), data.to_firestore_value());

        self.client
            .update_document(ENCODE_DATA, &id.to_string(), fields, &["data"])
            .await?;
        Ok(())
    }

    async fn update_progress(&self, id: i64, percent: f64) -> StoreResult<()> {
        let mut fields = HashMap::new();
        fields.insert("progress".to_string(), percent.to_firestore_value());

        self.client
            .update_document(ENCODE_DATA, &id.to_string(), fields, &["progress"])
            .await?;
        Ok(())
    }

    async fn list_jobs(&self, offset: u32, limit: u32) -> StoreResult<Vec<Job>> {
        let query = StructuredQuery::collection(JOBS)
            .order_desc("id")
            .page(offset, limit);
        let docs = self.client.run_query(query).await?;
        let mut jobs = docs
            .iter()
            .map(job_from_document)
            .collect::<StoreResult<Vec<_>>>()?;

        let names: Vec<String> = jobs
            .iter()
            .filter(|j| j.encode_data.id > 0)
            .map(|j| {
                self.client
                    .full_document_name(ENCODE_DATA, &j.encode_data.id.to_string())
            })
            .collect();

        let mut by_id: HashMap<i64, EncodeData> = HashMap::new();
        for chunk in names.chunks(100) {
            for doc in self.client.batch_get_documents(chunk.to_vec()).await? {
                let data = encode_data_from_document(&doc)?;
                by_id.insert(data.id, data);
            }
        }

        for job in &mut jobs {
            if let Some(data) = by_id.remove(&job.encode_data.id) {
                job.encode_data = data;
            }
        }
        Ok(jobs)
    }

    async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>> {
        let mut counts = Vec::with_capacity(JobStatus::ALL.len());
        for status in JobStatus::ALL {
            let query = StructuredQuery::collection(JOBS)
                .where_eq("status", status.as_str().to_firestore_value());
            let count = self.client.run_count_query(query).await?;
            counts.push(StatusCount { status, count });
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::client::FirestoreConfig;
    use crate::retry::RetryConfig;

    const DOCS: &str = "/v1/projects/p/databases/d/documents";

    fn store_for(server: &MockServer) -> FirestoreJobStore {
        let config = FirestoreConfig {
            project_id: "p".to_string(),
            database_id: "d".to_string(),
            endpoint: format!("{}/v1", server.uri()),
            emulator: true,
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            retry: RetryConfig::none(),
        };
        FirestoreJobStore::new(FirestoreClient::with_token_cache(config, None).unwrap())
    }

    fn counter_response(value: i64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "writeResults": [{"transformResults": [{"integerValue": value.to_string()}]}]
        }))
    }

    fn job_doc(guid: &str, status: &str) -> serde_json::Value {
        json!({
            "name": format!("projects/p/databases/d/documents/jobs/{}", guid),
            "fields": {
                "id": {"integerValue": "3"},
                "guid": {"stringValue": guid},
                "c24_job_id": {"stringValue": "abc"},
                "profile": {"stringValue": "720p"},
                "action": {"stringValue": "transcode"},
                "source": {"stringValue": "gs://in/a.mov"},
                "destination": {"stringValue": "gs://out/a.mp4"},
                "status": {"stringValue": status},
                "metadata": {"mapValue": {"fields": {"origin": {"stringValue": "pubsub"}}}},
                "callback": {"mapValue": {}},
                "encode_data_id": {"integerValue": "8"},
                "created_at": {"timestampValue": "2026-03-01T10:00:00Z"},
                "updated_at": {"timestampValue": "2026-03-01T10:05:00Z"}
            }
        })
    }

    #[test]
    fn test_job_document_roundtrip() {
        let mut job = NewJob::new("abc", "720p", JobAction::Download, "s3://b/k", "local")
            .into_job(5, 0, Utc::now());
        job.encode_data.id = 6;
        job.metadata.insert("k".to_string(), json!(1));

        let doc = Document::new(job_fields(&job));
        let back = job_from_document(&doc).unwrap();

        assert_eq!(back.guid, job.guid);
        assert_eq!(back.action, JobAction::Download);
        assert_eq!(back.encode_data.id, 6);
        assert_eq!(back.metadata.get("k"), Some(&json!(1)));
    }

    #[test]
    fn test_job_document_rejects_unknown_status() {
        let mut doc: Document = serde_json::from_value(job_doc("g", "queued")).unwrap();
        doc.fields
            .as_mut()
            .unwrap()
            .insert("status".to_string(), Value::StringValue("paused".into()));
        assert!(matches!(
            job_from_document(&doc),
            Err(StoreError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_create_allocates_ids_and_links_encode_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}:commit", DOCS)))
            .respond_with(counter_response(11))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/jobs", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fields": {}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("{}/encode_data", DOCS)))
            .and(query_param("documentId", "11"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fields": {}})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(query_param("updateMask.fieldPaths", "encode_data_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fields": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        let job = store
            .create(NewJob::new("abc", "720p", JobAction::Transcode, "gs://in/a.mov", "gs://out/a.mp4"))
            .await
            .unwrap();

        assert_eq!(job.id, 11);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.encode_data.id, 11);
        assert_eq!(job.encode_data.progress, 0.0);
    }

    #[tokio::test]
    async fn test_get_job_attaches_encode_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{}/jobs/g1", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(job_doc("g1", "encoding")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{}/encode_data/8", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "fields": {
                    "id": {"integerValue": "8"},
                    "job_id": {"integerValue": "3"},
                    "progress": {"doubleValue": 42.5},
                    "data": {"stringValue": "{\"format\":{}}"}
                }
            })))
            .mount(&server)
            .await;

        let job = store_for(&server)
            .get_job_by_guid(&JobGuid::from_string("g1"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.status, JobStatus::Encoding);
        assert_eq!(job.encode_data.progress, 42.5);
        assert_eq!(job.metadata.get("origin"), Some(&json!("pubsub")));
    }

    #[tokio::test]
    async fn test_update_status_missing_job_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(format!("{}/jobs/gone", DOCS)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .update_status(&JobGuid::from_string("gone"), JobStatus::Error)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_count_by_status_reports_every_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{}:runAggregationQuery", DOCS)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"result": {"aggregateFields": {"total": {"integerValue": "2"}}}}
            ])))
            .expect(JobStatus::ALL.len() as u64)
            .mount(&server)
            .await;

        let counts = store_for(&server).count_by_status().await.unwrap();
        assert_eq!(counts.len(), JobStatus::ALL.len());
        assert!(counts.iter().all(|c| c.count == 2));
        assert_eq!(counts[0].status, JobStatus::Queued);
    }
}
