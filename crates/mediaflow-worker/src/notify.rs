//! Completion notifications.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use mediaflow_models::Job;

use crate::error::{WorkerError, WorkerResult};

/// Fire-and-forget side channel for job events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> WorkerResult<()>;
}

/// Slack incoming-webhook notifier. Without a webhook it drops messages.
#[derive(Clone)]
pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> WorkerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| WorkerError::config_error(format!("slack client: {}", e)))?;
        Ok(Self { http, webhook_url })
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> WorkerResult<()> {
        let Some(url) = &self.webhook_url else {
            debug!("Slack webhook not configured, skipping notification");
            return Ok(());
        };

        let response = self
            .http
            .post(url)
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| WorkerError::notify_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerError::notify_failed(format!("{}: {}", status, body)));
        }
        Ok(())
    }
}

/// Message announcing a finished transcode.
pub fn encode_success_message(job: &Job) -> String {
    format!(
        "*Encode Successful!* :tada:\n\
         *ID*: {}\n\
         *Job ID*: {}\n\
         *Profile*: {}\n\
         *Source*: {}\n\
         *Destination*: {}\n",
        job.guid, job.c24_job_id, job.profile, job.source, job.destination
    )
}
