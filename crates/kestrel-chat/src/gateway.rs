//! Tool execution gateway.
//!
//! Resolves tool calls against the aggregated catalog, enforces the
//! approval policy, invokes the owning connection under a timeout, and
//! truncates oversized output. Every failure mode produces a valid
//! tool-role outcome; nothing raised here is fatal to the chat loop.

use crate::approval::{ApprovalChoice, ApprovalHandler, ApprovalPolicy, TOOL_DENIED_MARKER};
use async_trait::async_trait;
use kestrel_mcp::{
    ConnectionRegistry, McpResult, RemoteServerInfo, ToolCallResult, ToolDescriptor, TransportKind,
};
use kestrel_provider::Message;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum tool output length in characters.
pub const MAX_TOOL_OUTPUT_CHARS: usize = 20_000;

/// Per-call execution timeout.
pub const TOOL_CALL_TIMEOUT_SECS: u64 = 120;

/// The routing surface the gateway and coordinator need from the MCP
/// layer. Implemented by [`ConnectionRegistry`]; mocked in tests.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// Look up a tool in the aggregated catalog.
    async fn find_tool(&self, name: &str) -> Option<ToolDescriptor>;

    /// All tools in the aggregated catalog.
    async fn tools(&self) -> Vec<ToolDescriptor>;

    /// Call a tool by its catalog name.
    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult>;

    /// The transport kind of a server.
    async fn server_kind(&self, server_id: &str) -> Option<TransportKind>;

    /// Enabled remote servers for server-assisted declarations.
    async fn remote_servers(&self) -> Vec<RemoteServerInfo>;
}

#[async_trait]
impl ToolRouter for ConnectionRegistry {
    async fn find_tool(&self, name: &str) -> Option<ToolDescriptor> {
        ConnectionRegistry::find_tool(self, name).await
    }

    async fn tools(&self) -> Vec<ToolDescriptor> {
        ConnectionRegistry::tools(self).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        ConnectionRegistry::call_tool(self, name, arguments).await
    }

    async fn server_kind(&self, server_id: &str) -> Option<TransportKind> {
        ConnectionRegistry::server_kind(self, server_id).await
    }

    async fn remote_servers(&self) -> Vec<RemoteServerInfo> {
        ConnectionRegistry::remote_servers(self).await
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Correlation id from the assistant message.
    pub id: String,
    /// Catalog tool name.
    pub name: String,
    /// Parsed arguments.
    pub arguments: Value,
}

/// The result of one gateway execution, always expressible as a
/// tool-role message.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    /// Correlation id of the originating call.
    pub id: String,
    /// Catalog tool name.
    pub name: String,
    /// Output text (possibly truncated, possibly an error description).
    pub output: String,
    /// Whether this outcome describes a failure.
    pub is_error: bool,
}

impl ToolCallOutcome {
    /// Convert into a tool-role conversation message.
    pub fn into_message(self) -> Message {
        if self.is_error {
            Message::tool_error(self.id, self.output)
        } else {
            Message::tool_result(self.id, self.output)
        }
    }

    fn error(id: String, name: String, output: impl Into<String>) -> Self {
        Self {
            id,
            name,
            output: output.into(),
            is_error: true,
        }
    }
}

/// Truncate output beyond the limit, appending an explicit marker.
///
/// Output at or under the limit is returned unaltered. The cut respects
/// char boundaries so multi-byte text cannot be split.
pub fn truncate_output(output: String) -> String {
    let total_chars = output.chars().count();
    if total_chars <= MAX_TOOL_OUTPUT_CHARS {
        return output;
    }

    let kept: String = output.chars().take(MAX_TOOL_OUTPUT_CHARS).collect();
    format!(
        "{kept}\n\n[Output truncated: {total_chars} characters total, showing first {MAX_TOOL_OUTPUT_CHARS}]"
    )
}

/// Gateway between the chat loop and the MCP connections.
pub struct ToolGateway {
    router: Arc<dyn ToolRouter>,
    policy: ApprovalPolicy,
    handler: Arc<dyn ApprovalHandler>,
    call_timeout: std::time::Duration,
}

impl ToolGateway {
    /// Create a gateway.
    pub fn new(
        router: Arc<dyn ToolRouter>,
        policy: ApprovalPolicy,
        handler: Arc<dyn ApprovalHandler>,
    ) -> Self {
        Self {
            router,
            policy,
            handler,
            call_timeout: std::time::Duration::from_secs(TOOL_CALL_TIMEOUT_SECS),
        }
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The routing surface this gateway executes against.
    pub fn router(&self) -> &Arc<dyn ToolRouter> {
        &self.router
    }

    /// Resolve an approval for a tool by name, without executing anything.
    ///
    /// Shared with the coordinator for server-side approval requests.
    pub async fn resolve_approval(&self, tool_name: &str) -> bool {
        if self.policy.is_auto_approved(tool_name).await {
            return true;
        }

        match self.handler.decide(tool_name).await {
            ApprovalChoice::ApproveOnce | ApprovalChoice::ApproveAlways => true,
            ApprovalChoice::Deny => false,
        }
    }

    /// Execute one tool call.
    pub async fn execute(&self, request: ToolCallRequest) -> ToolCallOutcome {
        let ToolCallRequest {
            id,
            name,
            arguments,
        } = request;

        // A server that disconnected mid-turn takes its tools with it.
        if self.router.find_tool(&name).await.is_none() {
            warn!(tool = %name, "Unknown tool requested");
            return ToolCallOutcome::error(
                id,
                name.clone(),
                format!("Unknown tool '{name}': no connected server provides it"),
            );
        }

        if !self.resolve_approval(&name).await {
            info!(tool = %name, "Tool call denied");
            return ToolCallOutcome::error(
                id,
                name.clone(),
                format!("{TOOL_DENIED_MARKER}: '{name}'"),
            );
        }

        debug!(tool = %name, call_id = %id, "Executing tool call");

        let result = tokio::time::timeout(
            self.call_timeout,
            self.router.call_tool(&name, arguments),
        )
        .await;

        match result {
            Err(_) => {
                warn!(tool = %name, "Tool call timed out");
                ToolCallOutcome::error(
                    id,
                    name.clone(),
                    format!(
                        "Tool '{name}' timed out after {} seconds",
                        self.call_timeout.as_secs()
                    ),
                )
            }
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                ToolCallOutcome::error(id, name.clone(), format!("Tool '{name}' failed: {e}"))
            }
            Ok(Ok(result)) => {
                let is_error = result.is_error;
                let output = truncate_output(result.text());
                ToolCallOutcome {
                    id,
                    name,
                    output,
                    is_error,
                }
            }
        }
    }

    /// Execute a batch of tool calls from one assistant step.
    ///
    /// Calls are dispatched concurrently; a call suspended on an approval
    /// decision blocks only itself. Outcomes come back in request order,
    /// each carrying its correlation id.
    pub async fn execute_batch(&self, requests: Vec<ToolCallRequest>) -> Vec<ToolCallOutcome> {
        if requests.len() > 1 {
            info!(count = requests.len(), "Dispatching tool calls concurrently");
        }
        let futures = requests.into_iter().map(|request| self.execute(request));
        futures::future::join_all(futures).await
    }
}
