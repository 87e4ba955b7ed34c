//! Pub/Sub pull subscription over REST.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use mediaflow_models::IngestRequest;
use mediaflow_store::TokenCache;

use crate::config::PubSubConfig;
use crate::error::{DispatchError, DispatchResult};

/// OAuth scope for Pub/Sub access.
pub const PUBSUB_SCOPE: &str = "https://www.googleapis.com/auth/pubsub";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
    /// Base64 payload
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl PubsubMessage {
    /// Decode the payload as an ingest request.
    pub fn decode_request(&self) -> DispatchResult<IngestRequest> {
        let raw = STANDARD
            .decode(self.data.trim())
            .map_err(|e| DispatchError::malformed(format!("message {}: {}", self.message_id, e)))?;
        serde_json::from_slice(&raw)
            .map_err(|e| DispatchError::malformed(format!("message {}: {}", self.message_id, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

/// Minimal Pub/Sub subscriber client.
pub struct PubSubClient {
    http: Client,
    config: PubSubConfig,
    token_cache: Option<Arc<TokenCache>>,
}

impl PubSubClient {
    /// Create a client, loading service account credentials unless the
    /// config points at the emulator.
    pub fn new(config: PubSubConfig) -> DispatchResult<Self> {
        let token_cache = if config.emulator {
            None
        } else {
            let cache = TokenCache::from_service_account_env(&[PUBSUB_SCOPE])
                .map_err(|e| DispatchError::config_error(e.to_string()))?;
            Some(Arc::new(cache))
        };
        Self::with_token_cache(config, token_cache)
    }

    /// Create a client with an explicit token cache (`None` sends no auth).
    pub fn with_token_cache(
        config: PubSubConfig,
        token_cache: Option<Arc<TokenCache>>,
    ) -> DispatchResult<Self> {
        let http = Client::builder()
            .timeout(config.pull_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("mediaflow-dispatcher/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            config,
            token_cache,
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    fn url(&self, verb: &str) -> String {
        format!(
            "{}/v1/{}:{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.subscription_path(),
            verb
        )
    }

    async fn authorize(&self, request: RequestBuilder) -> DispatchResult<RequestBuilder> {
        match &self.token_cache {
            Some(cache) => {
                let token = cache.get_token().await?;
                Ok(request.bearer_auth(token))
            }
            None => Ok(request),
        }
    }

    async fn post(&self, verb: &str, body: serde_json::Value) -> DispatchResult<reqwest::Response> {
        let request = self.authorize(self.http.post(self.url(verb)).json(&body)).await?;
        let response = request.send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            if let Some(cache) = &self.token_cache {
                cache.invalidate().await;
            }
        }
        let message = response.text().await.unwrap_or_default();
        Err(DispatchError::PubSub {
            status: status.as_u16(),
            message,
        })
    }

    /// Pull up to `max_messages` messages.
    pub async fn pull(&self) -> DispatchResult<Vec<ReceivedMessage>> {
        let response = self
            .post("pull", json!({ "maxMessages": self.config.max_messages }))
            .await?;
        let body: PullResponse = response.json().await?;

        debug!(
            subscription = %self.config.subscription,
            count = body.received_messages.len(),
            "Pulled messages"
        );
        Ok(body.received_messages)
    }

    /// Acknowledge messages; a no-op for an empty list.
    pub async fn acknowledge(&self, ack_ids: &[String]) -> DispatchResult<()> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        self.post("acknowledge", json!({ "ackIds": ack_ids })).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> PubSubClient {
        PubSubClient::with_token_cache(
            PubSubConfig {
                project_id: "local".to_string(),
                subscription: "jobs-sub".to_string(),
                endpoint: server.uri(),
                emulator: true,
                ..Default::default()
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_decode_request() {
        let payload = r#"{"c24_job_id":"abc","profile":"720p","source":"gs://in/a.mov","dest":"gs://out/a.mp4","action":"transcode"}"#;
        let message = PubsubMessage {
            data: STANDARD.encode(payload),
            message_id: "1".to_string(),
            ..Default::default()
        };

        let request = message.decode_request().unwrap();
        assert_eq!(request.c24_job_id, "abc");
        assert_eq!(request.action, "transcode");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let not_base64 = PubsubMessage {
            data: "%%%".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            not_base64.decode_request(),
            Err(DispatchError::Malformed(_))
        ));

        let not_json = PubsubMessage {
            data: STANDARD.encode("hello"),
            ..Default::default()
        };
        assert!(not_json.decode_request().unwrap_err().is_permanent());
    }

    #[tokio::test]
    async fn test_pull_parses_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/local/subscriptions/jobs-sub:pull"))
            .and(body_json(json!({ "maxMessages": 10 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "receivedMessages": [
                    { "ackId": "ack-1", "message": { "data": "e30=", "messageId": "m-1" } }
                ]
            })))
            .mount(&server)
            .await;

        let messages = client(&server).pull().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ack_id, "ack-1");
        assert_eq!(messages[0].message.message_id, "m-1");
    }

    #[tokio::test]
    async fn test_empty_pull() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        assert!(client(&server).pull().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/projects/local/subscriptions/jobs-sub:acknowledge"))
            .and(body_json(json!({ "ackIds": ["a", "b"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server);
        client.acknowledge(&[]).await.unwrap();
        client
            .acknowledge(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_emulator_sends_no_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        assert!(client(&server).pull().await.is_ok());
    }

    #[tokio::test]
    async fn test_error_status_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("subscription not found"))
            .mount(&server)
            .await;

        let err = client(&server).pull().await.unwrap_err();
        assert!(matches!(err, DispatchError::PubSub { status: 404, .. }));
        assert!(!err.is_permanent());
    }
}
