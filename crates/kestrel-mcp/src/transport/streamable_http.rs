//! Streamable HTTP transport for remote MCP servers.
//!
//! Request and response share one HTTP exchange: the client POSTs a
//! JSON-RPC message and the server answers either with a plain JSON body
//! or with a short SSE body on the same connection, whose frames are
//! buffered until an event boundary is observed.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::sse::SseEventBuffer;
use crate::transport::Transport;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Streamable HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct StreamableHttpConfig {
    /// The server URL (e.g. `https://mcp.example.com/mcp`).
    pub url: String,
    /// Extra headers for every request.
    pub headers: HashMap<String, String>,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            auth_token: None,
            timeout_secs: 60,
        }
    }
}

/// Streamable HTTP transport for remote MCP servers.
pub struct StreamableHttpTransport {
    config: StreamableHttpConfig,
    client: Client,
    connected: AtomicBool,
    /// Session ID assigned by the server.
    session_id: RwLock<Option<String>>,
}

impl StreamableHttpTransport {
    /// Create a new streamable HTTP transport.
    pub fn new(config: StreamableHttpConfig) -> McpResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| McpError::connection_failed(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            connected: AtomicBool::new(false),
            session_id: RwLock::new(None),
        })
    }

    /// Set the authorization token.
    pub fn set_auth_token(&mut self, token: String) {
        self.config.auth_token = Some(token);
    }

    /// Build a POST with the common headers.
    async fn build_request(&self, body: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body.to_string());

        for (key, value) in &self.config.headers {
            req = req.header(key, value);
        }
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(ref session) = *self.session_id.read().await {
            req = req.header("Mcp-Session-Id", session.clone());
        }

        req
    }

    /// Parse the shared exchange's response body.
    async fn parse_response(&self, response: reqwest::Response) -> McpResult<JsonRpcResponse> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(McpError::protocol_error(format!(
                "Server returned {status}: {text}"
            )));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.parse_sse_body(response).await
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::protocol_error(format!("Failed to read response: {e}")))?;

            serde_json::from_str(&text)
                .map_err(|e| McpError::protocol_error(format!("Invalid JSON response: {e}")))
        }
    }

    /// Drain the SSE body of one exchange until a JSON-RPC response appears.
    async fn parse_sse_body(&self, response: reqwest::Response) -> McpResult<JsonRpcResponse> {
        let mut stream = response.bytes_stream();
        let mut frames = SseEventBuffer::default();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| McpError::protocol_error(format!("Stream error: {e}")))?;

            for (_event, data) in frames.push(&String::from_utf8_lossy(&chunk)) {
                match serde_json::from_str::<JsonRpcResponse>(&data) {
                    Ok(response) => return Ok(response),
                    Err(_) => {
                        // Notifications may interleave on the exchange.
                        debug!("Skipping non-response frame in exchange body");
                    }
                }
            }
        }

        Err(McpError::protocol_error(
            "Exchange body ended without a response",
        ))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let expected_id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request requires an id"))?;
        let body = serde_json::to_string(&request)?;

        debug!(id = expected_id, method = %request.method, "Sending streamable HTTP request");

        let response = self.build_request(&body).await.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else if e.is_connect() {
                self.connected.store(false, Ordering::SeqCst);
                McpError::connection_failed(format!("Connection failed: {e}"))
            } else {
                McpError::protocol_error(format!("Request failed: {e}"))
            }
        })?;

        // Remember the session id if the server assigned one.
        if let Some(session) = response.headers().get("mcp-session-id") {
            if let Ok(id) = session.to_str() {
                *self.session_id.write().await = Some(id.to_string());
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        let parsed = self.parse_response(response).await?;

        if parsed.id != expected_id {
            return Err(McpError::protocol_error(format!(
                "Response id {} does not match request id {expected_id}",
                parsed.id
            )));
        }

        Ok(parsed)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;

        debug!(method = %notification.method, "Sending streamable HTTP notification");

        let response = self
            .build_request(&body)
            .await
            .send()
            .await
            .map_err(|e| McpError::protocol_error(format!("Notification failed: {e}")))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Notification returned non-success status");
        }

        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        *self.session_id.write().await = None;
        debug!("Closed streamable HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = StreamableHttpConfig::default();
        assert!(config.url.is_empty());
        assert!(config.auth_token.is_none());
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_transport_creation() {
        let config = StreamableHttpConfig {
            url: "https://example.com/mcp".to_string(),
            auth_token: Some("test-token".to_string()),
            timeout_secs: 30,
            ..Default::default()
        };

        let transport = StreamableHttpTransport::new(config);
        assert!(transport.is_ok());
        assert!(!transport.unwrap().is_connected());
    }

    #[test]
    fn test_set_auth_token() {
        let mut transport = StreamableHttpTransport::new(StreamableHttpConfig {
            url: "https://example.com/mcp".to_string(),
            ..Default::default()
        })
        .unwrap();

        assert!(transport.config.auth_token.is_none());
        transport.set_auth_token("new-token".to_string());
        assert_eq!(transport.config.auth_token.as_deref(), Some("new-token"));
    }

    #[tokio::test]
    async fn test_request_connection_refused() {
        let transport = StreamableHttpTransport::new(StreamableHttpConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();

        let result = transport
            .request(JsonRpcRequest::new(1, "tools/list", None))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_notify_connection_refused() {
        let transport = StreamableHttpTransport::new(StreamableHttpConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();

        let result = transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_clears_session() {
        let transport = StreamableHttpTransport::new(StreamableHttpConfig {
            url: "https://example.com/mcp".to_string(),
            ..Default::default()
        })
        .unwrap();

        *transport.session_id.write().await = Some("session-1".to_string());
        transport.connected.store(true, Ordering::SeqCst);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(transport.session_id.read().await.is_none());
    }
}
