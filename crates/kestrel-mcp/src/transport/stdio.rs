//! stdio transport for locally spawned MCP servers.
//!
//! Each JSON-RPC message is a single line on the child's stdin/stdout. A
//! background reader demultiplexes responses to waiting callers by request
//! id and forwards id-less messages as notifications. When the process
//! exits, every pending request fails with `Disconnected`.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerMessage};
use crate::transport::{await_response, PendingRequests, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// stdio transport configuration.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    /// Command to spawn.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl StdioConfig {
    /// Create a config with the default timeout.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout_secs: 60,
        }
    }
}

/// stdio transport for local MCP servers.
pub struct StdioTransport {
    config: StdioConfig,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Arc<PendingRequests>,
    connected: Arc<AtomicBool>,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcNotification>>>,
}

impl StdioTransport {
    /// Spawn the server process and start the background reader.
    pub fn spawn(config: StdioConfig) -> McpResult<Self> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            McpError::process_error(format!("Failed to spawn {}: {e}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::process_error("Child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::process_error("Child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::process_error("Child stderr unavailable"))?;

        let pending = Arc::new(PendingRequests::new());
        let connected = Arc::new(AtomicBool::new(true));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        // Background reader: route responses by id, forward notifications.
        {
            let pending = pending.clone();
            let connected = connected.clone();
            let command_name = config.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            route_line(line, &pending, &notify_tx);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(command = %command_name, error = %e, "stdio read error");
                            break;
                        }
                    }
                }
                debug!(command = %command_name, "MCP server stdout closed");
                connected.store(false, Ordering::SeqCst);
                pending.close();
            });
        }

        // Drain stderr into the log so server diagnostics are not lost.
        {
            let command_name = config.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command_name, "server stderr: {line}");
                }
            });
        }

        Ok(Self {
            config,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            connected,
            notifications: Mutex::new(Some(notify_rx)),
        })
    }

    /// Write one newline-delimited frame to the child.
    async fn write_frame(&self, frame: &str) -> McpResult<()> {
        if !self.is_connected() {
            return Err(McpError::Disconnected);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(frame.as_bytes()).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            McpError::process_error(format!("Failed to write to server: {e}"))
        })?;
        stdin.write_all(b"\n").await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            McpError::process_error(format!("Failed to write to server: {e}"))
        })?;
        stdin.flush().await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            McpError::process_error(format!("Failed to flush server stdin: {e}"))
        })?;
        Ok(())
    }
}

/// Route one stdout line to the pending table or the notification channel.
fn route_line(
    line: &str,
    pending: &PendingRequests,
    notify_tx: &mpsc::UnboundedSender<JsonRpcNotification>,
) {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Discarding unparseable stdio frame");
            return;
        }
    };

    match ServerMessage::parse(value) {
        Some(ServerMessage::Response(response)) => {
            if !pending.complete(response) {
                debug!("Dropped response with no waiting caller");
            }
        }
        Some(ServerMessage::Notification(notification)) => {
            let _ = notify_tx.send(notification);
        }
        None => warn!("Discarding malformed server message"),
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse> {
        let id = request
            .id
            .ok_or_else(|| McpError::protocol_error("Request requires an id"))?;
        let frame = serde_json::to_string(&request)?;

        debug!(id, method = %request.method, "Sending stdio request");

        let rx = self.pending.register(id)?;
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.forget(id);
            return Err(e);
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
        let frame = serde_json::to_string(&notification)?;
        debug!(method = %notification.method, "Sending stdio notification");
        self.write_frame(&frame).await
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.pending.close();

        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            // Already exited is fine.
            debug!(error = %e, "Kill on close");
        }
        debug!("Closed stdio transport");
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
