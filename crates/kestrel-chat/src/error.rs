//! Error types for the chat crate.

use thiserror::Error;

/// Result type for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// Errors surfaced by the chat coordinator.
///
/// Tool execution failures never appear here; they are converted to
/// tool-role messages and the conversation continues.
#[derive(Debug, Error)]
pub enum ChatError {
    /// A turn is already running for this conversation.
    #[error("A turn is already in progress")]
    TurnInProgress,

    /// The turn was aborted by the user.
    #[error("Turn cancelled")]
    Cancelled,

    /// The backend stream carried a malformed or unexpected event.
    /// Partial content merged before the corruption is preserved.
    #[error("Stream protocol error: {0}")]
    StreamProtocol(String),

    /// Backend error starting or driving the stream.
    #[error(transparent)]
    Provider(#[from] kestrel_provider::ProviderError),

    /// MCP registry error.
    #[error(transparent)]
    Mcp(#[from] kestrel_mcp::McpError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            ChatError::TurnInProgress.to_string(),
            "A turn is already in progress"
        );
        assert_eq!(
            ChatError::StreamProtocol("bad event".to_string()).to_string(),
            "Stream protocol error: bad event"
        );
    }
}
