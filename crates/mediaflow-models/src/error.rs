//! Model error types.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    #[error("Work item missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid profile catalog: {0}")]
    InvalidProfiles(String),
}

impl ModelError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}
