//! Error types for credential storage operations.

use thiserror::Error;

/// Errors that can occur during credential storage operations.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Failed to read or write the credential file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize credential data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Could not determine the data directory.
    #[error("Could not determine data directory")]
    NoDataDir,

    /// Failed to set file permissions.
    #[error("Failed to set file permissions: {0}")]
    Permissions(String),
}

/// Result type for credential storage operations.
pub type AuthResult<T> = Result<T, AuthError>;
