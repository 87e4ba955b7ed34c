//! Provisioning error types.

use thiserror::Error;

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Cluster credentials unavailable: {0}")]
    Credentials(String),

    #[error("Invalid job specification: {0}")]
    InvalidSpec(String),

    #[error("Cluster rejected job ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unsupported action for provisioning: {0}")]
    UnsupportedAction(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }
}
