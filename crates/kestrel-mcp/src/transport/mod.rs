//! MCP transport implementations.
//!
//! Three transports carry the same JSON-RPC envelope: a spawned local
//! process speaking newline-delimited frames over stdio, a Server-Sent
//! Events channel paired with POSTed calls, and a streamable HTTP exchange
//! where request and response share one connection. All of them guarantee
//! at-most-one response per request id.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::{SseConfig, SseTransport};
pub use stdio::{StdioConfig, StdioTransport};
pub use streamable_http::{StreamableHttpConfig, StreamableHttpTransport};

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for a response.
    async fn request(&self, request: JsonRpcRequest) -> McpResult<JsonRpcResponse>;

    /// Send a notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> McpResult<()>;

    /// Close the transport, failing all in-flight requests.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Take the stream of server-initiated notifications.
    ///
    /// Yields `Some` at most once; transports without a server→client
    /// channel return `None`.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<JsonRpcNotification>> {
        None
    }
}

/// Table of in-flight requests awaiting responses, keyed by request id.
///
/// Shared by the stdio and SSE transports: a background reader routes each
/// response to exactly one waiting caller, and closing the table fails
/// every pending request with [`McpError::Disconnected`].
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
}

struct PendingState {
    closed: bool,
    waiting: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState {
                closed: false,
                waiting: HashMap::new(),
            }),
        }
    }

    /// Register a request id and obtain the receiver its response will be
    /// delivered on.
    pub fn register(&self, id: u64) -> McpResult<oneshot::Receiver<JsonRpcResponse>> {
        let mut state = self.state.lock().expect("pending table poisoned");
        if state.closed {
            return Err(McpError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        if state.waiting.insert(id, tx).is_some() {
            return Err(McpError::protocol_error(format!(
                "Request id {id} already in flight"
            )));
        }
        Ok(rx)
    }

    /// Deliver a response to the caller waiting on its id.
    ///
    /// Returns `false` for unknown ids (late responses after a timeout, or
    /// duplicates - the at-most-once guarantee).
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let sender = {
            let mut state = self.state.lock().expect("pending table poisoned");
            state.waiting.remove(&response.id)
        };
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Forget a request id (after a caller-side timeout).
    pub fn forget(&self, id: u64) {
        let mut state = self.state.lock().expect("pending table poisoned");
        state.waiting.remove(&id);
    }

    /// Fail all in-flight requests and refuse new registrations.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("pending table poisoned");
        state.closed = true;
        // Dropping the senders wakes every waiter with a channel error,
        // which the transports surface as Disconnected.
        state.waiting.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.state.lock().expect("pending table poisoned").waiting.len()
    }
}

/// Await a registered response with a timeout, cleaning up the pending
/// entry on expiry.
pub(crate) async fn await_response(
    pending: &PendingRequests,
    id: u64,
    rx: oneshot::Receiver<JsonRpcResponse>,
    timeout: std::time::Duration,
) -> McpResult<JsonRpcResponse> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(_)) => Err(McpError::Disconnected),
        Err(_) => {
            pending.forget(id);
            Err(McpError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(serde_json::json!({})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_complete() {
        let pending = PendingRequests::new();
        let rx = pending.register(1).unwrap();

        assert!(pending.complete(response(1)));

        let resp = rx.await.unwrap();
        assert_eq!(resp.id, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_response_per_id() {
        let pending = PendingRequests::new();
        let _rx = pending.register(1).unwrap();

        assert!(pending.complete(response(1)));
        // Second response to the same id has no waiter.
        assert!(!pending.complete(response(1)));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let pending = PendingRequests::new();
        let _rx = pending.register(1).unwrap();
        assert!(pending.register(1).is_err());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let pending = PendingRequests::new();
        let rx = pending.register(1).unwrap();
        let rx2 = pending.register(2).unwrap();

        pending.close();

        assert!(rx.await.is_err());
        assert!(rx2.await.is_err());
        assert!(matches!(pending.register(3), Err(McpError::Disconnected)));
    }

    #[tokio::test]
    async fn test_await_response_timeout_forgets_entry() {
        let pending = PendingRequests::new();
        let rx = pending.register(1).unwrap();

        let err = await_response(&pending, 1, rx, std::time::Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout));
        assert_eq!(pending.len(), 0);

        // Late response for the forgotten id is dropped.
        assert!(!pending.complete(response(1)));
    }

    #[tokio::test]
    async fn test_unknown_response_dropped() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(response(99)));
    }
}
