//! Provider error types.

use thiserror::Error;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Invalid API response.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The stream carried an event that does not fit the protocol.
    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    /// Missing API key.
    #[error("Missing API key for backend: {0}")]
    MissingApiKey(String),

    /// Invalid API key.
    #[error("Invalid API key for backend: {0}")]
    InvalidApiKey(String),

    /// Rate limited.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<std::time::Duration>,
    },

    /// Stream interrupted mid-turn.
    #[error("Stream interrupted")]
    StreamInterrupted,

    /// Operation cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (for streaming).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// API error with status code.
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    /// Internal provider error.
    #[error("Provider error: {message}")]
    Internal { message: String },
}

impl ProviderError {
    /// Create an invalid response error.
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    /// Create a stream protocol error.
    pub fn stream_protocol(message: impl Into<String>) -> Self {
        Self::StreamProtocol(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an API error.
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Create an invalid API key error.
    pub fn invalid_api_key(backend: impl Into<String>) -> Self {
        Self::InvalidApiKey(backend.into())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RequestFailed(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::StreamInterrupted
        )
    }
}
