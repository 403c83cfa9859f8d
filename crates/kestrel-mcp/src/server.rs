//! MCP server configuration and status.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transport used to reach an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Locally spawned process, newline-delimited JSON-RPC over stdio.
    Stdio,
    /// Remote server: long-lived SSE stream plus POSTed calls.
    Sse,
    /// Remote server: request and response share one streaming HTTP exchange.
    StreamableHttp,
}

/// OAuth settings for a remote server that requires authorization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthServerConfig {
    /// Pre-registered client ID (optional; dynamic registration otherwise).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Pre-registered client secret (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Requested scopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Configuration for an MCP server.
///
/// Immutable once connected; the registry refuses to replace the config of
/// a live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server id (unique identifier).
    pub id: String,

    /// Transport kind.
    #[serde(rename = "type")]
    pub kind: TransportKind,

    /// Command to spawn (stdio transport).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Command arguments (stdio transport).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment variables for the spawned process (stdio transport).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// URL (sse / streamableHttp transports).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra headers (sse / streamableHttp transports).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// OAuth settings; presence marks the server as requiring authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthServerConfig>,

    /// Whether the server is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio(
        id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: TransportKind::Stdio,
            command: Some(command.into()),
            args: args.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            oauth: None,
            enabled: true,
        }
    }

    /// Create an SSE server configuration.
    pub fn sse(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TransportKind::Sse,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            oauth: None,
            enabled: true,
        }
    }

    /// Create a streamable HTTP server configuration.
    pub fn streamable_http(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::StreamableHttp,
            ..Self::sse(id, url)
        }
    }

    /// Add a header (remote transports).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add an environment variable (stdio transport).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mark the server as requiring OAuth.
    pub fn with_oauth(mut self, oauth: OAuthServerConfig) -> Self {
        self.oauth = Some(oauth);
        self
    }

    /// Disable the server.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether this config describes a remote (HTTP) server.
    pub fn is_remote(&self) -> bool {
        matches!(self.kind, TransportKind::Sse | TransportKind::StreamableHttp)
    }
}

/// Status of an MCP server as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ServerStatus {
    /// Server is not connected.
    #[default]
    Disconnected,
    /// Server is connecting.
    Connecting,
    /// Server is connected and its tools are discovered.
    Connected,
    /// OAuth authorization for the server is in progress.
    Authenticating,
    /// Server encountered an error.
    Error(String),
}

impl ServerStatus {
    /// Short status label for UI surfaces.
    pub fn label(&self) -> &str {
        match self {
            ServerStatus::Disconnected => "disconnected",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Connected => "connected",
            ServerStatus::Authenticating => "authenticating",
            ServerStatus::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdio_config() {
        let config = ServerConfig::stdio("files", "npx", vec!["-y", "server-filesystem"])
            .with_env("HOME", "/home/user");
        assert_eq!(config.id, "files");
        assert_eq!(config.kind, TransportKind::Stdio);
        assert_eq!(config.command.as_deref(), Some("npx"));
        assert_eq!(config.args, vec!["-y", "server-filesystem"]);
        assert_eq!(config.env.get("HOME"), Some(&"/home/user".to_string()));
        assert!(!config.is_remote());
    }

    #[test]
    fn test_sse_config() {
        let config = ServerConfig::sse("docs", "https://example.com/sse")
            .with_header("Authorization", "Bearer token");
        assert_eq!(config.kind, TransportKind::Sse);
        assert_eq!(config.url.as_deref(), Some("https://example.com/sse"));
        assert_eq!(
            config.headers.get("Authorization"),
            Some(&"Bearer token".to_string())
        );
        assert!(config.is_remote());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ServerConfig::streamable_http("remote", "https://example.com/mcp")
            .with_oauth(OAuthServerConfig::default());
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"type\":\"streamableHttp\""));

        let parsed: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, TransportKind::StreamableHttp);
        assert!(parsed.oauth.is_some());
        assert!(parsed.enabled);
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let json = r#"{"id": "x", "type": "stdio", "command": "cmd"}"#;
        let parsed: ServerConfig = serde_json::from_str(json).unwrap();
        assert!(parsed.enabled);
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(ServerStatus::Connected.label(), "connected");
        assert_eq!(ServerStatus::Error("boom".to_string()).label(), "error");
        assert_eq!(ServerStatus::default().label(), "disconnected");
    }
}
