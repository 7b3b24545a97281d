use shared::error::{ApiError, ErrorCode};
use storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server rejected request: {0}")]
    Api(ApiError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid server url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },
    #[error("no reset is awaiting confirmation")]
    NoPendingReset,
    #[error("event stream failed: {0}")]
    Events(String),
}

impl ClientError {
    /// Unreachable servers are reported the same way as an unreachable store.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Api(err) => err.code,
            ClientError::Transport(_) => ErrorCode::StorageUnavailable,
            ClientError::Store(err) => err.code(),
            ClientError::InvalidServerUrl { .. }
            | ClientError::NoPendingReset
            | ClientError::Events(_) => ErrorCode::Unknown,
        }
    }
}
