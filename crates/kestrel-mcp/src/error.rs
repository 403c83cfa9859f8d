//! MCP error types.

use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Server not found.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// Tool not found.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server process failed to spawn or died.
    #[error("Server process error: {0}")]
    ProcessError(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The remote server answered a request with a JSON-RPC error.
    #[error("Remote error {code}: {message}")]
    RemoteError { code: i64, message: String },

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The connection was closed while requests were in flight.
    #[error("Connection closed")]
    Disconnected,

    /// Server initialization failed.
    #[error("Server initialization failed: {0}")]
    InitializationFailed(String),

    /// Authentication required.
    #[error("Authentication required")]
    AuthRequired,

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpError {
    /// Create a connection failed error.
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create a protocol error.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Create a process error.
    pub fn process_error(message: impl Into<String>) -> Self {
        Self::ProcessError(message.into())
    }

    /// Create a remote error from a JSON-RPC error object.
    pub fn remote(code: i64, message: impl Into<String>) -> Self {
        Self::RemoteError {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                McpError::ServerNotFound("test".to_string()),
                "Server not found: test",
            ),
            (
                McpError::ToolNotFound("tool".to_string()),
                "Tool not found: tool",
            ),
            (
                McpError::ConnectionFailed("timeout".to_string()),
                "Connection failed: timeout",
            ),
            (
                McpError::ProcessError("exit 1".to_string()),
                "Server process error: exit 1",
            ),
            (
                McpError::remote(-32601, "method not found"),
                "Remote error -32601: method not found",
            ),
            (McpError::Timeout, "Request timed out"),
            (McpError::Disconnected, "Connection closed"),
            (McpError::AuthRequired, "Authentication required"),
            (
                McpError::AuthFailed("bad token".to_string()),
                "Authentication failed: bad token",
            ),
        ];

        for (error, expected) in errors {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_error_constructors() {
        let conn_err = McpError::connection_failed("failed to connect");
        assert!(conn_err.to_string().contains("Connection failed"));

        let proto_err = McpError::protocol_error("invalid message");
        assert!(proto_err.to_string().contains("Protocol error"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let mcp_err: McpError = io_err.into();
        assert!(mcp_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let mcp_err: McpError = json_err.into();
        assert!(mcp_err.to_string().contains("JSON error"));
    }
}
