//! SSE transport for remote MCP servers.
//!
//! One long-lived GET stream carries server→client events; client→server
//! calls are POSTs to the message endpoint the server announces with its
//! `endpoint` event. Responses arriving on either channel are correlated
//! to callers by request id.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerMessage};
use crate::transport::{await_response, PendingRequests, Transport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to wait for the server's `endpoint` event before giving up.
const ENDPOINT_WAIT_SECS: u64 = 10;

/// SSE transport configuration.
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// The SSE stream URL (e.g. `https://mcp.example.com/sse`).
    pub url: String,
    /// Extra headers for every request.
    pub headers: HashMap<String, String>,
    /// Optional bearer token.
    pub auth_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            headers: HashMap::new(),
            auth_token: None,
            timeout_secs: 60,
        }
    }
}

/// Incremental SSE frame parser.
///
/// Buffers partial chunks until a `\n\n` event boundary is observed and
/// yields `(event, data)` pairs; the event name defaults to `message`.
#[derive(Default)]
pub(crate) struct SseEventBuffer {
    buffer: String,
}

impl SseEventBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<(String, String)> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(end) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..end + 2).collect();
            let mut event = String::from("message");
            let mut data = String::new();

            for line in raw.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    event = value.trim().to_string();
                } else if let Some(value) = line.strip_prefix("data:") {
                    if !data.is_empty() {
                        data.push('\n');
                    }
                    data.push_str(value.trim_start());
                }
            }

            if !data.is_empty() {
                events.push((event, data));
            }
        }

        events
    }
}

/// SSE transport for remote MCP servers.
pub struct SseTransport {
    config: SseConfig,
    client: Client,
    /// POST endpoint announced by the server.
    endpoint: RwLock<Option<String>>,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcNotification>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the message endpoint.
    pub async fn connect(config: SseConfig) -> McpResult<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| McpError::connection_failed(format!("Failed to create HTTP client: {e}")))?;

        let mut request = client
            .get(&config.url)
            .header("Accept", "text/event-stream");
        for (key, value) in &config.headers {
            request = request.header(key, value);
        }
        if let Some(ref token) = config.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                McpError::connection_failed(format!("Connection failed: {e}"))
            } else {
                McpError::protocol_error(format!("SSE request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::AuthRequired);
        }
        if !status.is_success() {
            return Err(McpError::connection_failed(format!(
                "SSE stream returned {status}"
            )));
        }

        let pending = Arc::new(PendingRequests::new());
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        // Background reader over the long-lived GET stream.
        {
            let pending = pending.clone();
            let connected = connected.clone();
            let cancel = cancel.clone();
            let base_url = config.url.clone();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut frames = SseEventBuffer::default();
                let mut endpoint_tx = Some(endpoint_tx);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        chunk = stream.next() => {
                            let Some(chunk) = chunk else { break };
                            let chunk = match chunk {
                                Ok(c) => c,
                                Err(e) => {
                                    warn!(error = %e, "SSE stream error");
                                    break;
                                }
                            };

                            for (event, data) in frames.push(&String::from_utf8_lossy(&chunk)) {
                                match event.as_str() {
                                    "endpoint" => {
                                        let resolved = resolve_endpoint(&base_url, &data);
                                        if let Some(tx) = endpoint_tx.take() {
                                            let _ = tx.send(resolved);
                                        }
                                    }
                                    _ => route_event(&data, &pending, &notify_tx),
                                }
                            }
                        }
                    }
                }

                debug!("SSE stream closed");
                connected.store(false, Ordering::SeqCst);
                pending.close();
            });
        }

        // The server must announce where POSTs go before we can speak.
        let endpoint = match tokio::time::timeout(
            std::time::Duration::from_secs(ENDPOINT_WAIT_SECS),
            endpoint_rx,
        )
        .await
        {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                cancel.cancel();
                return Err(McpError::connection_failed(
                    "SSE stream closed before announcing an endpoint",
                ));
            }
            Err(_) => {
                cancel.cancel();
                return Err(McpError::connection_failed(
                    "Timed out waiting for SSE endpoint event",
                ));
            }
        };

        debug!(endpoint = %endpoint, "SSE transport connected");

        Ok(Self {
            config,
            client,
            endpoint: RwLock::new(Some(endpoint)),
            pending,
            connected,
            cancel,
            notifications: Mutex::new(Some(notify_rx)),
        })
    }

    /// POST one JSON-RPC message to the announced endpoint.
    async fn post_message(&self, body: String) -> McpResult<reqwest::Response> {
        let endpoint = self
            .endpoint
            .read()
            .await
            .clone()
            .ok_or(McpError::Disconnected)?;

        let mut request = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .body(body);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(ref token) = self.config.auth_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                McpError::Timeout
            } else if e.is_connect() {
                McpError::connection_failed(format!("Connection failed: {e}"))
            } else {
                McpError::protocol_error(format!("Request failed: {e}"))
            }
        })?;

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

        Ok(response)
    }
}

/// Resolve a possibly-relative endpoint URI against the stream URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(endpoint)) {
        Ok(resolved) => resolved.to_string(),
        Err(_) => endpoint.to_string(),
    }
}

/// Route one data payload from the event stream.
fn route_event(
    data: &str,
    pending: &PendingRequests,
    notify_tx: &mpsc::UnboundedSender<JsonRpcNotification>,
) {
    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Discarding unparseable SSE payload");
            return;
        }
    };

    match ServerMessage::parse(value) {
        Some(ServerMessage::Response(response)) => {
            if !pending.complete(response) {
                debug!("Dropped SSE response with no waiting caller");
            }
        }
        Some(ServerMessage::Notification(notification)) => {
            let _ = notify_tx.send(notification);
        }
        None => warn!("Discarding malformed SSE message"),
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request requires an id"))?;
        let body = serde_json::to_string(&request)?;

        debug!(id, method = %request.method, "Sending SSE request");

        let rx = self.pending.register(id)?;
        let response = match self.post_message(body).await {
            Ok(r) => r,
            Err(e) => {
                self.pending.forget(id);
                return Err(e);
            }
        };

        // Some servers answer on the POST body instead of the event
        // stream; route such replies through the same pending table so the
        // at-most-once guarantee holds either way.
        if let Ok(text) = response.text().await {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                if let Ok(direct) = serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    self.pending.complete(direct);
                }
            }
        }

        await_response(
            &self.pending,
            id,
            rx,
            std::time::Duration::from_secs(self.config.timeout_secs),
        )
        .await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let body = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending SSE notification");
        self.post_message(body).await.map(|_| ())
    }

    async fn close(&self) -> McpResult<()> {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        self.pending.close();
        *self.endpoint.write().await = None;
        debug!("Closed SSE transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcNotification>> {
        self.notifications
            .try_lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }
}
