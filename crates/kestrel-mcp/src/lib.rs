//! Model Context Protocol (MCP) client for kestrel.
//!
//! MCP lets kestrel connect to external tool servers over three
//! transports and surface their tools to the chat loop through one
//! aggregated catalog.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌─────────────────────┐     ┌─────────────┐
//! │ kestrel  │────▶│ Connection Registry │────▶│ MCP Servers │
//! │  (chat)  │◀────│  transports, OAuth  │◀────│   (tools)   │
//! └──────────┘     └─────────────────────┘     └─────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: local servers spawned as a child process
//! - **SSE**: remote servers via a Server-Sent Events channel
//! - **streamable HTTP**: remote servers sharing one HTTP exchange
//!
//! Remote servers may require OAuth 2.0 with PKCE; the registry runs the
//! flow and reconnects with the obtained token.
//!
//! # Example
//!
//! ```no_run
//! use kestrel_mcp::{ConnectionRegistry, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(kestrel_auth::CredentialStore::new()?);
//! let registry = Arc::new(ConnectionRegistry::new(store));
//!
//! registry
//!     .add_config(ServerConfig::stdio(
//!         "filesystem",
//!         "npx",
//!         vec!["-y", "@modelcontextprotocol/server-filesystem"],
//!     ))
//!     .await?;
//!
//! registry.connect_all().await;
//! registry.clone().start_health_checks();
//!
//! let result = registry
//!     .call_tool("read_file", serde_json::json!({"path": "/tmp/x"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod error;
pub mod oauth;
pub mod protocol;
pub mod registry;
mod server;
pub mod transport;

pub use callback::{CallbackListener, OAUTH_CALLBACK_PATH, OAUTH_CALLBACK_PORT_BASE};
pub use error::{McpError, McpResult};
pub use oauth::{OAuthFlow, OAuthPhase, OAuthTokens, StoredTokens};
pub use protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpTool, ToolCallResult, ToolContent};
pub use registry::{
    ConnectionRegistry, RegistryEvent, RemoteServerInfo, ToolCatalogEntry, ToolDescriptor,
    HEALTH_CHECK_INTERVAL_SECS,
};
pub use server::{OAuthServerConfig, ServerConfig, ServerStatus, TransportKind};
pub use transport::{
    SseConfig, SseTransport, StdioConfig, StdioTransport, StreamableHttpConfig,
    StreamableHttpTransport, Transport,
};
