//! Dispatcher error types.

use thiserror::Error;

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] mediaflow_models::ModelError),

    #[error("Action not supported yet: {0}")]
    Unsupported(String),

    #[error("Store error: {0}")]
    Store(#[from] mediaflow_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] mediaflow_queue::QueueError),

    #[error("Pub/Sub error ({status}): {message}")]
    PubSub { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl DispatchError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether redelivering the same message can never succeed.
    ///
    /// Permanent failures are acknowledged and dropped; everything else is
    /// left unacknowledged for redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DispatchError::Malformed(_)
                | DispatchError::InvalidRequest(_)
                | DispatchError::Unsupported(_)
        )
    }
}
