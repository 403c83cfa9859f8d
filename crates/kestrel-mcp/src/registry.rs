//! Connection registry for MCP servers.
//!
//! Owns the set of configured servers, their live connections, the
//! aggregated tool catalog, and per-server status. Drives connect,
//! disconnect, reconnect-after-OAuth, and the periodic health probe.

use crate::error::{McpError, McpResult};
use crate::oauth::OAuthFlow;
use crate::protocol::{
    InitializeParams, InitializeResult, JsonRpcNotification, JsonRpcRequest, ListToolsResult,
    McpTool, ToolCallResult,
};
use crate::server::{ServerConfig, ServerStatus, TransportKind};
use crate::transport::{
    SseConfig, SseTransport, StdioConfig, StdioTransport, StreamableHttpConfig,
    StreamableHttpTransport, Transport,
};
use kestrel_auth::CredentialStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between liveness probes.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Timeout for one liveness probe.
const HEALTH_PROBE_TIMEOUT_SECS: u64 = 10;

/// A tool in the aggregated catalog.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Catalog name, unique across servers (prefixed on collision).
    pub name: String,
    /// Name of the tool on its owning server.
    pub remote_name: String,
    /// Tool description.
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    pub input_schema: Option<Value>,
    /// Id of the owning server.
    pub server_id: String,
}

/// Catalog entry surfaced to the UI layer.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCatalogEntry {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub server_id: String,
    pub status: String,
}

/// A remote server declared to a server-assisted chat backend.
#[derive(Debug, Clone)]
pub struct RemoteServerInfo {
    pub server_id: String,
    pub url: String,
    pub auth_token: Option<String>,
}

/// Events emitted by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A server's status changed.
    StatusChanged {
        server_id: String,
        status: ServerStatus,
    },
    /// The aggregated tool catalog changed.
    ToolsChanged,
}

/// A live connection binding a config to a transport session.
struct Connection {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    /// Monotonically increasing request id counter.
    next_id: AtomicU64,
    /// Unix timestamp of the last successful liveness probe.
    last_healthy: AtomicU64,
}

impl Connection {
    fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            next_id: AtomicU64::new(1),
            last_healthy: AtomicU64::new(kestrel_auth::current_time_secs()),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Issue one request on this connection and unwrap its result.
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        let response = self.transport.request(request).await?;
        response.into_result()
    }

    fn mark_healthy(&self) {
        self.last_healthy
            .store(kestrel_auth::current_time_secs(), Ordering::SeqCst);
    }
}

/// Registry of MCP server connections.
///
/// Process-scoped state with explicit init and teardown: create one at
/// startup, pass it to the components that need it, call [`shutdown`]
/// on exit.
///
/// [`shutdown`]: ConnectionRegistry::shutdown
pub struct ConnectionRegistry {
    configs: RwLock<HashMap<String, ServerConfig>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    statuses: RwLock<HashMap<String, ServerStatus>>,
    /// Aggregated catalog in registration order; order matters for the
    /// collision-prefixing rule.
    tools: RwLock<Vec<ToolDescriptor>>,
    events: broadcast::Sender<RegistryEvent>,
    store: Arc<CredentialStore>,
    health_started: AtomicBool,
    health_cancel: CancellationToken,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new(store: Arc<CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            configs: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            tools: RwLock::new(Vec::new()),
            events,
            store,
            health_started: AtomicBool::new(false),
            health_cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Add or replace a server configuration.
    ///
    /// Configs are immutable while connected: replacing the config of a
    /// live connection is refused.
    pub async fn add_config(&self, config: ServerConfig) -> McpResult<()> {
        if self.connections.read().await.contains_key(&config.id) {
            return Err(McpError::connection_failed(format!(
                "Server '{}' is connected; disconnect before editing its config",
                config.id
            )));
        }
        let mut statuses = self.statuses.write().await;
        statuses
            .entry(config.id.clone())
            .or_insert(ServerStatus::Disconnected);
        drop(statuses);

        self.configs.write().await.insert(config.id.clone(), config);
        Ok(())
    }

    /// Remove a server configuration, disconnecting it first.
    pub async fn remove_config(&self, id: &str) -> McpResult<()> {
        self.disconnect(id).await?;
        self.configs.write().await.remove(id);
        self.statuses.write().await.remove(id);
        Ok(())
    }

    /// List configured server ids.
    pub async fn server_ids(&self) -> Vec<String> {
        self.configs.read().await.keys().cloned().collect()
    }

    /// Get the status of a server.
    pub async fn status(&self, id: &str) -> ServerStatus {
        self.statuses
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or(ServerStatus::Disconnected)
    }

    /// Connect every enabled configured server concurrently.
    ///
    /// Failures are independent: one server's error never blocks the
    /// others, and the per-server status carries the outcome.
    pub async fn connect_all(&self) {
        let ids: Vec<String> = {
            let configs = self.configs.read().await;
            configs
                .values()
                .filter(|c| c.enabled)
                .map(|c| c.id.clone())
                .collect()
        };

        let futures = ids.iter().map(|id| async move {
            if let Err(e) = self.connect(id).await {
                warn!(server = %id, error = %e, "Failed to connect MCP server");
            }
        });

        futures::future::join_all(futures).await;
    }

    /// Connect one server. Idempotent: connecting a connected or currently
    /// connecting server is a no-op.
    pub async fn connect(&self, id: &str) -> McpResult<()> {
        let config = {
            let configs = self.configs.read().await;
            configs
                .get(id)
                .cloned()
                .ok_or_else(|| McpError::ServerNotFound(id.to_string()))?
        };

        if !config.enabled {
            debug!(server = %id, "Server is disabled, skipping");
            return Ok(());
        }

        match self.status(id).await {
            ServerStatus::Connected | ServerStatus::Connecting | ServerStatus::Authenticating => {
                return Ok(());
            }
            _ => {}
        }

        self.set_status(id, ServerStatus::Connecting).await;
        info!(server = %id, "Connecting to MCP server");

        match self.connect_inner(&config).await {
            Ok(()) => {
                self.set_status(id, ServerStatus::Connected).await;
                Ok(())
            }
            Err(e) => {
                self.set_status(id, ServerStatus::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn connect_inner(&self, config: &ServerConfig) -> McpResult<()> {
        let token = self.cached_token(config).await?;

        match self.establish(config, token).await {
            Ok(()) => Ok(()),
            // Remote server demands authorization: run the OAuth flow and
            // reconnect exactly once with the fresh token.
            Err(McpError::AuthRequired) if config.oauth.is_some() => {
                info!(server = %config.id, "Server requires authorization");
                self.set_status(&config.id, ServerStatus::Authenticating).await;

                let url = config
                    .url
                    .clone()
                    .ok_or_else(|| McpError::AuthFailed("Server has no URL".to_string()))?;
                let oauth = config.oauth.clone().unwrap_or_default();
                let flow = OAuthFlow::new(&config.id, &url, &oauth, self.store.clone());
                let tokens = flow.authorize().await?;

                self.set_status(&config.id, ServerStatus::Connecting).await;
                self.establish(config, Some(tokens.access_token)).await
            }
            Err(e) => Err(e),
        }
    }

    /// Open the transport, perform the handshake and discover tools.
    async fn establish(&self, config: &ServerConfig, auth_token: Option<String>) -> McpResult<()> {
        let transport = open_transport(config, auth_token).await?;
        let connection = Arc::new(Connection::new(config.clone(), transport));

        let init = match handshake(&connection).await {
            Ok(init) => init,
            Err(e) => {
                let _ = connection.transport.close().await;
                return Err(e);
            }
        };

        debug!(
            server = %config.id,
            protocol_version = %init.protocol_version,
            server_name = %init.server_info.name,
            "MCP server initialized"
        );

        // A server with no usable tools is not kept alive.
        let discovered = match discover_tools(&connection).await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = connection.transport.close().await;
                return Err(McpError::InitializationFailed(format!(
                    "Tool discovery failed: {e}"
                )));
            }
        };

        info!(server = %config.id, tool_count = discovered.len(), "Discovered MCP tools");

        // Drain server-initiated notifications into the log.
        if let Some(mut notifications) = connection.transport.take_notifications() {
            let server_id = config.id.clone();
            tokio::spawn(async move {
                while let Some(note) = notifications.recv().await {
                    debug!(server = %server_id, method = %note.method, "Server notification");
                }
            });
        }

        self.connections
            .write()
            .await
            .insert(config.id.clone(), connection);
        self.add_tools(&config.id, discovered).await;

        Ok(())
    }

    /// Disconnect one server. Idempotent; in-flight requests on the
    /// connection fail with `Disconnected`.
    pub async fn disconnect(&self, id: &str) -> McpResult<()> {
        self.disconnect_with_status(id, ServerStatus::Disconnected)
            .await
    }

    async fn disconnect_with_status(&self, id: &str, status: ServerStatus) -> McpResult<()> {
        let connection = self.connections.write().await.remove(id);

        if let Some(connection) = connection {
            if let Err(e) = connection.transport.close().await {
                warn!(server = %id, error = %e, "Error closing server connection");
            }
            self.remove_tools(id).await;
            info!(server = %id, "Disconnected from MCP server");
        }

        self.set_status(id, status).await;
        Ok(())
    }

    /// Retry a server that previously failed.
    ///
    /// Only the `Error → Connecting` transition is allowed here;
    /// connected and connecting servers are left alone.
    pub async fn retry(&self, id: &str) -> McpResult<()> {
        match self.status(id).await {
            ServerStatus::Error(_) | ServerStatus::Disconnected => {
                // Clear any stale half-open connection first.
                self.disconnect(id).await?;
                self.connect(id).await
            }
            _ => Ok(()),
        }
    }

    /// Disconnect everything and stop the health loop.
    pub async fn shutdown(&self) {
        self.health_cancel.cancel();
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    /// Start the periodic health loop. Starts at most once.
    pub fn start_health_checks(self: Arc<Self>) {
        if self.health_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.clone();
        let cancel = self.health_cancel.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so probes start
            // one interval after startup.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        registry.run_health_checks().await;
                    }
                }
            }
        });
    }

    /// Probe every connected server once.
    pub async fn run_health_checks(&self) {
        let connections: Vec<(String, Arc<Connection>)> = {
            let guard = self.connections.read().await;
            guard
                .iter()
                .map(|(id, conn)| (id.clone(), conn.clone()))
                .collect()
        };

        for (id, connection) in connections {
            let probe = tokio::time::timeout(
                std::time::Duration::from_secs(HEALTH_PROBE_TIMEOUT_SECS),
                connection.request("tools/list", None),
            )
            .await;

            let failure = match probe {
                Ok(Ok(_)) => {
                    connection.mark_healthy();
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "health probe timed out".to_string(),
            };

            warn!(server = %id, error = %failure, "Health check failed, disconnecting");
            let _ = self
                .disconnect_with_status(
                    &id,
                    ServerStatus::Error(format!("health check failed: {failure}")),
                )
                .await;
        }
    }

    /// The transport kind of a configured server.
    pub async fn server_kind(&self, id: &str) -> Option<TransportKind> {
        self.configs.read().await.get(id).map(|c| c.kind)
    }

    /// Enabled remote servers with their stored bearer tokens, for
    /// declaration to a server-assisted chat backend.
    pub async fn remote_servers(&self) -> Vec<RemoteServerInfo> {
        let configs: Vec<ServerConfig> = {
            let guard = self.configs.read().await;
            guard
                .values()
                .filter(|c| c.enabled && c.is_remote() && c.url.is_some())
                .cloned()
                .collect()
        };

        let mut servers = Vec::new();
        for config in configs {
            let auth_token = crate::oauth::stored_tokens(&self.store, &config.id)
                .await
                .ok()
                .flatten()
                .filter(|t| t.is_valid())
                .map(|t| t.access_token);
            servers.push(RemoteServerInfo {
                server_id: config.id,
                url: config.url.unwrap_or_default(),
                auth_token,
            });
        }
        servers
    }

    /// Look up a tool in the aggregated catalog.
    pub async fn find_tool(&self, name: &str) -> Option<ToolDescriptor> {
        let tools = self.tools.read().await;
        tools.iter().find(|t| t.name == name).cloned()
    }

    /// All tools in the aggregated catalog.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().await.clone()
    }

    /// The catalog surface consumed by the UI layer.
    pub async fn tool_catalog(&self) -> Vec<ToolCatalogEntry> {
        let tools = self.tools.read().await.clone();
        let statuses = self.statuses.read().await;
        tools
            .into_iter()
            .map(|t| {
                let status = statuses
                    .get(&t.server_id)
                    .cloned()
                    .unwrap_or(ServerStatus::Disconnected);
                ToolCatalogEntry {
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                    server_id: t.server_id,
                    status: status.label().to_string(),
                }
            })
            .collect()
    }

    /// Call a tool by its catalog name, routing to the owning connection.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResult<ToolCallResult> {
        let descriptor = self
            .find_tool(name)
            .await
            .ok_or_else(|| McpError::ToolNotFound(name.to_string()))?;

        let connection = {
            let connections = self.connections.read().await;
            connections
                .get(&descriptor.server_id)
                .cloned()
                .ok_or_else(|| McpError::ServerNotFound(descriptor.server_id.clone()))?
        };

        debug!(tool = %name, server = %descriptor.server_id, "Calling MCP tool");

        let params = crate::protocol::CallToolParams {
            name: descriptor.remote_name.clone(),
            arguments: Some(arguments),
        };

        let result = connection
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;

        serde_json::from_value(result).map_err(|e| McpError::protocol_error(e.to_string()))
    }

    /// Record a status and emit an event if it changed.
    async fn set_status(&self, id: &str, status: ServerStatus) {
        let changed = {
            let mut statuses = self.statuses.write().await;
            let previous = statuses.insert(id.to_string(), status.clone());
            previous.as_ref() != Some(&status)
        };

        if changed {
            debug!(server = %id, status = %status.label(), "Server status changed");
            let _ = self.events.send(RegistryEvent::StatusChanged {
                server_id: id.to_string(),
                status,
            });
        }
    }

    /// Add discovered tools to the catalog, prefixing on name collision.
    async fn add_tools(&self, server_id: &str, discovered: Vec<McpTool>) {
        let mut tools = self.tools.write().await;
        for tool in discovered {
            let name = if tools.iter().any(|t| t.name == tool.name) {
                let prefixed = format!("{server_id}_{}", tool.name);
                debug!(tool = %tool.name, renamed = %prefixed, "Tool name collision");
                prefixed
            } else {
                tool.name.clone()
            };

            tools.push(ToolDescriptor {
                name,
                remote_name: tool.name,
                description: tool.description,
                input_schema: tool.input_schema,
                server_id: server_id.to_string(),
            });
        }
        drop(tools);

        let _ = self.events.send(RegistryEvent::ToolsChanged);
    }

    /// Remove a server's tools from the catalog.
    async fn remove_tools(&self, server_id: &str) {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|t| t.server_id != server_id);
        let removed = before - tools.len();
        drop(tools);

        if removed > 0 {
            debug!(server = %server_id, removed, "Removed tools from catalog");
            let _ = self.events.send(RegistryEvent::ToolsChanged);
        }
    }

    /// Resolve the bearer token for a remote server, refreshing stored
    /// OAuth tokens when possible.
    async fn cached_token(&self, config: &ServerConfig) -> McpResult<Option<String>> {
        if config.oauth.is_none() || !config.is_remote() {
            return Ok(None);
        }
        let url = config
            .url
            .clone()
            .ok_or_else(|| McpError::AuthFailed("Server has no URL".to_string()))?;
        let oauth = config.oauth.clone().unwrap_or_default();
        let flow = OAuthFlow::new(&config.id, &url, &oauth, self.store.clone());
        flow.cached_access_token().await
    }
}

/// Open the transport matching the config's kind.
async fn open_transport(
    config: &ServerConfig,
    auth_token: Option<String>,
) -> McpResult<Arc<dyn Transport>> {
    match config.kind {
        TransportKind::Stdio => {
            let command = config.command.clone().ok_or_else(|| {
                McpError::connection_failed("stdio transport requires a command")
            })?;
            let transport = StdioTransport::spawn(StdioConfig {
                command,
                args: config.args.clone(),
                env: config.env.clone(),
                timeout_secs: 60,
            })?;
            Ok(Arc::new(transport))
        }
        TransportKind::Sse => {
            let url = config
                .url
                .clone()
                .ok_or_else(|| McpError::connection_failed("sse transport requires a url"))?;
            let transport = SseTransport::connect(SseConfig {
                url,
                headers: config.headers.clone(),
                auth_token,
                timeout_secs: 60,
            })
            .await?;
            Ok(Arc::new(transport))
        }
        TransportKind::StreamableHttp => {
            let url = config.url.clone().ok_or_else(|| {
                McpError::connection_failed("streamableHttp transport requires a url")
            })?;
            let transport = StreamableHttpTransport::new(StreamableHttpConfig {
                url,
                headers: config.headers.clone(),
                auth_token,
                timeout_secs: 60,
            })?;
            Ok(Arc::new(transport))
        }
    }
}

/// Perform the MCP initialize handshake.
async fn handshake(connection: &Connection) -> McpResult<InitializeResult> {
    let params = InitializeParams::default();
    let result = connection
        .request("initialize", Some(serde_json::to_value(&params)?))
        .await
        .map_err(|e| match e {
            McpError::AuthRequired => McpError::AuthRequired,
            other => McpError::InitializationFailed(other.to_string()),
        })?;

    let init: InitializeResult = serde_json::from_value(result)
        .map_err(|e| McpError::InitializationFailed(format!("Invalid initialize result: {e}")))?;

    connection
        .transport
        .notify(JsonRpcNotification::new("notifications/initialized", None))
        .await?;

    Ok(init)
}

/// Fetch the server's tool list.
async fn discover_tools(connection: &Connection) -> McpResult<Vec<McpTool>> {
    let result = connection.request("tools/list", None).await?;
    let list: ListToolsResult = serde_json::from_value(result)
        .map_err(|e| McpError::protocol_error(format!("Invalid tools/list result: {e}")))?;
    Ok(list.tools)
}
