//! OAuth callback listener.
//!
//! A short-lived loopback HTTP server that receives the browser redirect
//! at the end of an authorization flow. The listener is a scoped resource:
//! it is torn down on success, failure, and timeout alike.

use crate::error::{McpError, McpResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// First port probed for the callback listener.
pub const OAUTH_CALLBACK_PORT_BASE: u16 = 8790;

/// How many ports above the base to probe before giving up.
const PORT_SCAN_RANGE: u16 = 16;

/// Callback path the authorization server redirects to.
pub const OAUTH_CALLBACK_PATH: &str = "/oauth/callback";

/// HTML response for successful authorization.
const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Kestrel - Authorization Successful</title>
  <style>
    body { font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #1a1a2e; color: #eee; }
    .container { text-align: center; padding: 2rem; }
    h1 { color: #4ade80; margin-bottom: 1rem; }
    p { color: #aaa; }
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Successful</h1>
    <p>You can close this window and return to Kestrel.</p>
  </div>
  <script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#;

/// HTML response for failed authorization.
fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Kestrel - Authorization Failed</title>
  <style>
    body {{ font-family: system-ui, -apple-system, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #1a1a2e; color: #eee; }}
    .container {{ text-align: center; padding: 2rem; }}
    h1 {{ color: #f87171; margin-bottom: 1rem; }}
    p {{ color: #aaa; }}
    .error {{ color: #fca5a5; font-family: monospace; margin-top: 1rem; padding: 1rem; background: rgba(248,113,113,0.1); border-radius: 0.5rem; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>Authorization Failed</h1>
    <p>An error occurred during authorization.</p>
    <div class="error">{}</div>
  </div>
</body>
</html>"#,
        html_escape(error)
    )
}

/// Escape HTML special characters.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Pending authorization request.
struct PendingAuth {
    /// Channel the authorization code is delivered on.
    sender: oneshot::Sender<Result<String, String>>,
}

/// Listener state shared with the accept loop.
struct ListenerState {
    /// Pending authorizations keyed by state nonce.
    pending: HashMap<String, PendingAuth>,
}

/// Loopback HTTP listener for OAuth redirects.
pub struct CallbackListener {
    port: u16,
    state: Arc<RwLock<ListenerState>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl CallbackListener {
    /// Bind the first free loopback port at or above the base port and
    /// start accepting connections.
    pub async fn bind() -> McpResult<Self> {
        let mut bound = None;
        for port in OAUTH_CALLBACK_PORT_BASE..OAUTH_CALLBACK_PORT_BASE + PORT_SCAN_RANGE {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    bound = Some((port, listener));
                    break;
                }
                Err(_) => continue,
            }
        }

        let (port, listener) = bound.ok_or_else(|| {
            McpError::connection_failed(format!(
                "No free port for the OAuth callback listener in {}..{}",
                OAUTH_CALLBACK_PORT_BASE,
                OAUTH_CALLBACK_PORT_BASE + PORT_SCAN_RANGE
            ))
        })?;

        info!(port, "OAuth callback listener started");

        let state = Arc::new(RwLock::new(ListenerState {
            pending: HashMap::new(),
        }));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        {
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            match result {
                                Ok((stream, _)) => {
                                    let state = state.clone();
                                    tokio::spawn(async move {
                                        if let Err(e) = handle_connection(stream, state).await {
                                            warn!(error = %e, "Error handling OAuth callback");
                                        }
                                    });
                                }
                                Err(e) => {
                                    warn!(error = %e, "Error accepting callback connection");
                                }
                            }
                        }
                        _ = &mut shutdown_rx => {
                            info!("OAuth callback listener shutting down");
                            break;
                        }
                    }
                }
            });
        }

        Ok(Self {
            port,
            state,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// The bound loopback port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The redirect URI the authorization server should send the browser to.
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, OAUTH_CALLBACK_PATH)
    }

    /// Wait for the callback carrying the given state nonce.
    ///
    /// Returns the authorization code, or an error on denial, state
    /// mismatch, or timeout.
    pub async fn wait_for_callback(
        &self,
        oauth_state: String,
        timeout: std::time::Duration,
    ) -> McpResult<String> {
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.state.write().await;
            state
                .pending
                .insert(oauth_state.clone(), PendingAuth { sender: tx });
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(code))) => Ok(code),
            Ok(Ok(Err(error))) => Err(McpError::AuthFailed(error)),
            Ok(Err(_)) => {
                let mut state = self.state.write().await;
                state.pending.remove(&oauth_state);
                Err(McpError::AuthFailed("Authorization cancelled".to_string()))
            }
            Err(_) => {
                let mut state = self.state.write().await;
                state.pending.remove(&oauth_state);
                Err(McpError::AuthFailed(
                    "OAuth callback timeout - authorization took too long".to_string(),
                ))
            }
        }
    }

    /// Stop the listener, cancelling every pending authorization.
    pub async fn shutdown(&self) {
        let mut tx = self.shutdown_tx.lock().await;
        if let Some(sender) = tx.take() {
            let _ = sender.send(());
        }

        let mut state = self.state.write().await;
        for (_, pending) in state.pending.drain() {
            let _ = pending
                .sender
                .send(Err("OAuth callback listener stopped".to_string()));
        }
    }
}

/// Handle one incoming HTTP connection.
async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    state: Arc<RwLock<ListenerState>>,
) -> McpResult<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buffer = [0u8; 4096];
    let n = stream
        .read(&mut buffer)
        .await
        .map_err(|e| McpError::protocol_error(format!("Failed to read request: {e}")))?;

    let request = String::from_utf8_lossy(&buffer[..n]);

    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();

    if parts.len() < 2 {
        let response = http_response(400, "text/plain", "Bad Request");
        stream.write_all(response.as_bytes()).await.ok();
        return Ok(());
    }

    let path = parts[1];

    let url = format!("http://127.0.0.1{path}");
    let parsed = match url::Url::parse(&url) {
        Ok(u) => u,
        Err(_) => {
            let response = http_response(400, "text/plain", "Invalid URL");
            stream.write_all(response.as_bytes()).await.ok();
            return Ok(());
        }
    };

    if parsed.path() != OAUTH_CALLBACK_PATH {
        let response = http_response(404, "text/plain", "Not Found");
        stream.write_all(response.as_bytes()).await.ok();
        return Ok(());
    }

    let params: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let code = params.get("code");
    let oauth_state = params.get("state");
    let error = params.get("error");
    let error_description = params.get("error_description");

    debug!(
        has_code = code.is_some(),
        state = ?oauth_state,
        error = ?error,
        "Received OAuth callback"
    );

    let oauth_state = match oauth_state {
        Some(s) => s.clone(),
        None => {
            error!("OAuth callback missing state parameter");
            fail_all_pending(&state, "Missing state parameter").await;
            let html = html_error("Missing required state parameter - potential CSRF attack");
            let response = http_response(400, "text/html", &html);
            stream.write_all(response.as_bytes()).await.ok();
            return Ok(());
        }
    };

    // Authorization server reported an error (user denied, etc.).
    if let Some(err) = error {
        let error_msg = error_description.cloned().unwrap_or_else(|| err.clone());

        let mut guard = state.write().await;
        if let Some(pending) = guard.pending.remove(&oauth_state) {
            let _ = pending.sender.send(Err(error_msg.clone()));
        }
        drop(guard);

        let html = html_error(&error_msg);
        let response = http_response(200, "text/html", &html);
        stream.write_all(response.as_bytes()).await.ok();
        return Ok(());
    }

    let code = match code {
        Some(c) => c.clone(),
        None => {
            let html = html_error("No authorization code provided");
            let response = http_response(400, "text/html", &html);
            stream.write_all(response.as_bytes()).await.ok();
            return Ok(());
        }
    };

    // The state nonce must match a pending flow exactly; an unknown nonce
    // fails the waiting flow rather than leaving it to time out.
    let pending = {
        let mut guard = state.write().await;
        guard.pending.remove(&oauth_state)
    };
    let pending = match pending {
        Some(p) => p,
        None => {
            error!(state = %oauth_state, "OAuth callback with mismatched state");
            fail_all_pending(&state, "State parameter mismatch").await;
            let html = html_error("Invalid or expired state parameter - potential CSRF attack");
            let response = http_response(400, "text/html", &html);
            stream.write_all(response.as_bytes()).await.ok();
            return Ok(());
        }
    };

    let _ = pending.sender.send(Ok(code));

    let response = http_response(200, "text/html", HTML_SUCCESS);
    stream.write_all(response.as_bytes()).await.ok();

    Ok(())
}

/// Fail every pending flow after a callback that cannot be trusted.
async fn fail_all_pending(state: &Arc<RwLock<ListenerState>>, reason: &str) {
    let mut guard = state.write().await;
    for (_, pending) in guard.pending.drain() {
        let _ = pending.sender.send(Err(reason.to_string()));
    }
}

/// Build an HTTP response.
fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    )
}
