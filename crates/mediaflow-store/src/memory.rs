//! In-memory job store.
//!
//! Used for local runs (`JOB_STORE=memory`) and as the test double for the
//! router and pipeline. Besides the current state it keeps the full status
//! and progress history so tests can assert on ordering.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use mediaflow_models::{EncodeData, Job, JobGuid, JobStatus, NewJob, StatusCount};

use crate::error::{StoreError, StoreResult};
use crate::repository::JobStore;

#[derive(Default)]
struct State {
    next_job_id: i64,
    next_encode_id: i64,
    jobs: HashMap<JobGuid, Job>,
    encode_data: HashMap<i64, EncodeData>,
    status_history: HashMap<JobGuid, Vec<JobStatus>>,
    progress_history: HashMap<i64, Vec<f64>>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status written for `guid`, starting with `queued`.
    pub async fn status_history(&self, guid: &JobGuid) -> Vec<JobStatus> {
        let state = self.state.read().await;
        state.status_history.get(guid).cloned().unwrap_or_default()
    }

    /// Every progress value written for an encode data record, starting with 0.
    pub async fn progress_history(&self, encode_data_id: i64) -> Vec<f64> {
        let state = self.state.read().await;
        state
            .progress_history
            .get(&encode_data_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        if state.jobs.contains_key(&new_job.guid) {
            return Err(StoreError::AlreadyExists(format!("jobs/{}", new_job.guid)));
        }

        state.next_job_id += 1;
        let job = new_job.into_job(state.next_job_id, 0, Utc::now());
        state
            .status_history
            .insert(job.guid.clone(), vec![JobStatus::Queued]);
        state.jobs.insert(job.guid.clone(), job.clone());
        Ok(job)
    }

    async fn create_encode_data(&self, job: &Job) -> StoreResult<EncodeData> {
        let mut state = self.state.write().await;
        let stored = state
            .jobs
            .get(&job.guid)
            .ok_or_else(|| StoreError::not_found(format!("jobs/{}", job.guid)))?;
        let job_id = stored.id;

        state.next_encode_id += 1;
        let encode_data = EncodeData::empty(state.next_encode_id, job_id);
        state
            .encode_data
            .insert(encode_data.id, encode_data.clone());
        state.progress_history.insert(encode_data.id, vec![0.0]);
        if let Some(stored) = state.jobs.get_mut(&job.guid) {
            stored.encode_data = encode_data.clone();
        }
        Ok(encode_data)
    }

    async fn get_job_by_guid(&self, guid: &JobGuid) -> StoreResult<Option<Job>> {
        let state = self.state.read().await;
        Ok(state.jobs.get(guid).map(|job| {
            let mut job = job.clone();
            if let Some(data) = state.encode_data.get(&job.encode_data.id) {
                job.encode_data = data.clone();
            }
            job
        }))
    }

    async fn update_status(&self, guid: &JobGuid, status: JobStatus) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get_mut(guid)
            .ok_or_else(|| StoreError::not_found(format!("jobs/{}", guid)))?;
        job.status = status;
        job.updated_at = Utc::now();
        state
            .status_history
            .entry(guid.clone())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn update_encode_data(&self, id: i64, data: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .encode_data
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("encode_data/{}", id)))?;
        record.data = data.to_string();
        Ok(())
    }

    async fn update_progress(&self, id: i64, percent: f64) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .encode_data
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found(format!("encode_data/{}", id)))?;
        record.progress = percent;
        state.progress_history.entry(id).or_default().push(percent);
        Ok(())
    }

    async fn list_jobs(&self, offset: u32, limit: u32) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.id.cmp(&a.id));

        Ok(jobs
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|mut job| {
                if let Some(data) = state.encode_data.get(&job.encode_data.id) {
                    job.encode_data = data.clone();
                }
                job
            })
            .collect())
    }

    async fn count_by_status(&self) -> StoreResult<Vec<StatusCount>> {
        let state = self.state.read().await;
        Ok(JobStatus::ALL
            .iter()
            .map(|status| StatusCount {
                status: *status,
                count: state.jobs.values().filter(|j| j.status == *status).count() as u64,
            })
            .collect())
    }
}
