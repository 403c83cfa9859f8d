//! OAuth support for remote MCP servers.
//!
//! Implements OAuth 2.0 with PKCE for authenticating with remote MCP
//! servers: metadata discovery, dynamic client registration, the
//! authorization-code exchange, and token refresh. Tokens and registered
//! clients are persisted through the external credential store; the flow
//! itself keeps no state beyond one authorization attempt.

use crate::callback::CallbackListener;
use crate::error::{McpError, McpResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use kestrel_auth::CredentialStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How long the flow waits for the browser callback.
pub const CALLBACK_TIMEOUT_SECS: u64 = 5 * 60;

/// Tokens considered expired this many seconds before their deadline.
const EXPIRY_SKEW_SECS: u64 = 60;

/// OAuth tokens as returned by the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Tokens persisted with an absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp when the access token expires.
    pub expires_at: Option<u64>,
    pub scope: Option<String>,
}

impl StoredTokens {
    fn from_tokens(tokens: OAuthTokens) -> Self {
        let now = kestrel_auth::current_time_secs();
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_in.map(|exp| now + exp),
            scope: tokens.scope,
        }
    }

    /// Whether the access token is still usable (with expiry skew).
    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > kestrel_auth::current_time_secs() + EXPIRY_SKEW_SECS,
            None => true,
        }
    }
}

/// Client registration (from dynamic registration or config).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Redirect URI the client was registered with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

/// Authorization server metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

impl ServerMetadata {
    /// Documented defaults for servers without a metadata document.
    fn fallback(origin: &str) -> Self {
        Self {
            authorization_endpoint: format!("{origin}/authorize"),
            token_endpoint: format!("{origin}/token"),
            registration_endpoint: Some(format!("{origin}/register")),
        }
    }
}

/// Phases of one authorization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthPhase {
    Idle,
    DiscoveringMetadata,
    RegisteringClient,
    AwaitingAuthorization,
    ExchangingCode,
    Complete,
    Failed,
}

/// Generate a PKCE code verifier.
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Generate the S256 code challenge for a verifier.
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let result = hasher.finalize();
    URL_SAFE_NO_PAD.encode(result)
}

/// Generate a random state nonce.
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(&bytes)
}

/// Build the authorization URL.
pub fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
) -> String {
    let mut url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&state={}&code_challenge={}&code_challenge_method=S256",
        auth_endpoint,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if let Some(scope) = scope {
        url.push_str(&format!("&scope={}", urlencoding::encode(scope)));
    }

    url
}

/// Derive the server origin (scheme + authority) from its MCP URL.
pub fn server_origin(server_url: &str) -> McpResult<String> {
    let parsed = url::Url::parse(server_url)
        .map_err(|e| McpError::AuthFailed(format!("Invalid server URL: {e}")))?;
    let origin = parsed.origin();
    if !matches!(origin, url::Origin::Tuple(..)) {
        return Err(McpError::AuthFailed(format!(
            "Server URL has no usable origin: {server_url}"
        )));
    }
    Ok(origin.ascii_serialization())
}

/// Fetch authorization server metadata, falling back to the documented
/// default endpoints when no metadata document is served.
pub async fn discover_metadata(client: &reqwest::Client, origin: &str) -> ServerMetadata {
    let well_known = format!("{origin}/.well-known/oauth-authorization-server");

    match client.get(&well_known).send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<ServerMetadata>().await {
                Ok(metadata) => {
                    debug!(origin = %origin, "Discovered authorization server metadata");
                    metadata
                }
                Err(e) => {
                    warn!(error = %e, "Invalid metadata document, using defaults");
                    ServerMetadata::fallback(origin)
                }
            }
        }
        Ok(response) => {
            debug!(status = %response.status(), "No metadata document, using defaults");
            ServerMetadata::fallback(origin)
        }
        Err(e) => {
            warn!(error = %e, "Metadata fetch failed, using defaults");
            ServerMetadata::fallback(origin)
        }
    }
}

/// Register a dynamic client with the authorization server.
pub async fn register_client(
    client: &reqwest::Client,
    registration_endpoint: &str,
    redirect_uri: &str,
) -> McpResult<RegisteredClient> {
    let body = serde_json::json!({
        "redirect_uris": [redirect_uri],
        "client_name": "Kestrel",
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "token_endpoint_auth_method": "none",
    });

    let response = client
        .post(registration_endpoint)
        .json(&body)
        .send()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Client registration failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::AuthFailed(format!(
            "Client registration failed: {text}"
        )));
    }

    #[derive(Deserialize)]
    struct RegistrationResponse {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
    }

    let registration: RegistrationResponse = response
        .json()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Invalid registration response: {e}")))?;

    Ok(RegisteredClient {
        client_id: registration.client_id,
        client_secret: registration.client_secret,
        redirect_uri: Some(redirect_uri.to_string()),
    })
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> McpResult<OAuthTokens> {
    let client = reqwest::Client::new();

    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", client_id),
        ("code_verifier", code_verifier),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    let response = client
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Token request failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::AuthFailed(format!(
            "Token exchange failed: {text}"
        )));
    }

    let tokens: OAuthTokens = response
        .json()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Invalid token response: {e}")))?;

    Ok(tokens)
}

/// Refresh tokens using a refresh token.
pub async fn refresh_tokens(
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    refresh_token: &str,
) -> McpResult<OAuthTokens> {
    let client = reqwest::Client::new();

    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];

    if let Some(secret) = client_secret {
        params.push(("client_secret", secret));
    }

    let response = client
        .post(token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Refresh request failed: {e}")))?;

    if !response.status().is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(McpError::AuthFailed(format!(
            "Token refresh failed: {text}"
        )));
    }

    let tokens: OAuthTokens = response
        .json()
        .await
        .map_err(|e| McpError::AuthFailed(format!("Invalid refresh response: {e}")))?;

    Ok(tokens)
}

fn tokens_key(server_id: &str) -> String {
    format!("mcp_oauth_tokens:{server_id}")
}

fn client_key(server_id: &str) -> String {
    format!("mcp_oauth_client:{server_id}")
}

/// Load persisted tokens for a server.
pub async fn stored_tokens(
    store: &CredentialStore,
    server_id: &str,
) -> McpResult<Option<StoredTokens>> {
    let value = store
        .get(&tokens_key(server_id))
        .await
        .map_err(|e| McpError::AuthFailed(format!("Credential store error: {e}")))?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Persist tokens for a server.
pub async fn save_tokens(
    store: &CredentialStore,
    server_id: &str,
    tokens: &StoredTokens,
) -> McpResult<()> {
    store
        .set(&tokens_key(server_id), serde_json::to_value(tokens)?)
        .await
        .map_err(|e| McpError::AuthFailed(format!("Credential store error: {e}")))?;
    Ok(())
}

/// Drop persisted tokens for a server.
pub async fn clear_tokens(store: &CredentialStore, server_id: &str) -> McpResult<()> {
    store
        .remove(&tokens_key(server_id))
        .await
        .map_err(|e| McpError::AuthFailed(format!("Credential store error: {e}")))?;
    Ok(())
}

/// One OAuth authorization attempt for an MCP server.
///
/// The flow owns its PKCE pair, state nonce and callback listener for the
/// duration of `authorize` and nothing outlives the call except what the
/// credential store persists.
pub struct OAuthFlow {
    server_id: String,
    server_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    scope: Option<String>,
    store: Arc<CredentialStore>,
    http: reqwest::Client,
    /// Open the authorization URL in the default browser.
    open_browser: bool,
}

impl OAuthFlow {
    /// Create a flow for a server.
    pub fn new(
        server_id: impl Into<String>,
        server_url: impl Into<String>,
        config: &crate::server::OAuthServerConfig,
        store: Arc<CredentialStore>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            server_url: server_url.into(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
            store,
            http: reqwest::Client::new(),
            open_browser: true,
        }
    }

    /// Disable launching the browser (the caller displays the URL instead).
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    /// Return a valid access token, refreshing a stored one if possible.
    ///
    /// Returns `None` when a full authorization is required.
    pub async fn cached_access_token(&self) -> McpResult<Option<String>> {
        let Some(tokens) = stored_tokens(&self.store, &self.server_id).await? else {
            return Ok(None);
        };

        if tokens.is_valid() {
            return Ok(Some(tokens.access_token));
        }

        let Some(ref refresh_token) = tokens.refresh_token else {
            return Ok(None);
        };

        let client = match self.client(None).await? {
            Some(client) => client,
            None => return Ok(None),
        };

        let origin = server_origin(&self.server_url)?;
        let metadata = discover_metadata(&self.http, &origin).await;

        match refresh_tokens(
            &metadata.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            refresh_token,
        )
        .await
        {
            Ok(new_tokens) => {
                let stored = StoredTokens::from_tokens(new_tokens);
                save_tokens(&self.store, &self.server_id, &stored).await?;
                info!(server = %self.server_id, "Refreshed OAuth tokens");
                Ok(Some(stored.access_token))
            }
            Err(e) => {
                debug!(server = %self.server_id, error = %e, "Token refresh failed");
                Ok(None)
            }
        }
    }

    /// Run the full authorization-code flow and return fresh tokens.
    ///
    /// The callback listener is torn down on every exit path. Each phase
    /// reported by tracing corresponds to one arm of the flow's state
    /// machine; any failure is terminal for the attempt.
    pub async fn authorize(&self) -> McpResult<OAuthTokens> {
        debug!(server = %self.server_id, phase = ?OAuthPhase::DiscoveringMetadata, "OAuth flow started");

        let origin = server_origin(&self.server_url)?;
        let metadata = discover_metadata(&self.http, &origin).await;

        // The listener binds before registration so the redirect URI is
        // known when the client is created.
        let listener = CallbackListener::bind().await?;
        let redirect_uri = listener.redirect_uri();

        let result = self
            .authorize_with_listener(&listener, &metadata, &redirect_uri)
            .await;

        // Unconditional teardown.
        listener.shutdown().await;

        match &result {
            Ok(_) => info!(server = %self.server_id, phase = ?OAuthPhase::Complete, "OAuth flow complete"),
            Err(e) => warn!(server = %self.server_id, phase = ?OAuthPhase::Failed, error = %e, "OAuth flow failed"),
        }

        result
    }

    async fn authorize_with_listener(
        &self,
        listener: &CallbackListener,
        metadata: &ServerMetadata,
        redirect_uri: &str,
    ) -> McpResult<OAuthTokens> {
        debug!(server = %self.server_id, phase = ?OAuthPhase::RegisteringClient, "Resolving client");
        let client = match self.client(Some(redirect_uri)).await? {
            Some(client) => client,
            None => {
                let registration_endpoint = metadata.registration_endpoint.as_deref().ok_or_else(
                    || McpError::AuthFailed("Server supports no client registration".to_string()),
                )?;
                let registered =
                    register_client(&self.http, registration_endpoint, redirect_uri).await?;
                self.store
                    .set(
                        &client_key(&self.server_id),
                        serde_json::to_value(&registered)?,
                    )
                    .await
                    .map_err(|e| McpError::AuthFailed(format!("Credential store error: {e}")))?;
                info!(server = %self.server_id, "Registered dynamic OAuth client");
                registered
            }
        };

        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        let state = generate_state();

        let auth_url = build_auth_url(
            &metadata.authorization_endpoint,
            &client.client_id,
            redirect_uri,
            self.scope.as_deref(),
            &state,
            &challenge,
        );

        debug!(server = %self.server_id, phase = ?OAuthPhase::AwaitingAuthorization, "Opening authorization URL");
        if self.open_browser {
            let url = auth_url.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = open::that(&url) {
                    warn!(error = %e, "Failed to open browser");
                }
            });
        }
        info!(server = %self.server_id, url = %auth_url, "Authorization URL");

        let code = listener
            .wait_for_callback(
                state,
                std::time::Duration::from_secs(CALLBACK_TIMEOUT_SECS),
            )
            .await?;

        debug!(server = %self.server_id, phase = ?OAuthPhase::ExchangingCode, "Exchanging authorization code");
        let tokens = exchange_code(
            &metadata.token_endpoint,
            &client.client_id,
            client.client_secret.as_deref(),
            &code,
            redirect_uri,
            &verifier,
        )
        .await?;

        save_tokens(
            &self.store,
            &self.server_id,
            &StoredTokens::from_tokens(tokens.clone()),
        )
        .await?;

        Ok(tokens)
    }

    /// Resolve the OAuth client: configured, or previously registered for
    /// the same redirect URI.
    async fn client(&self, redirect_uri: Option<&str>) -> McpResult<Option<RegisteredClient>> {
        if let Some(ref client_id) = self.client_id {
            return Ok(Some(RegisteredClient {
                client_id: client_id.clone(),
                client_secret: self.client_secret.clone(),
                redirect_uri: redirect_uri.map(str::to_string),
            }));
        }

        let stored = self
            .store
            .get(&client_key(&self.server_id))
            .await
            .map_err(|e| McpError::AuthFailed(format!("Credential store error: {e}")))?;

        let Some(client) = stored.and_then(|v| serde_json::from_value::<RegisteredClient>(v).ok())
        else {
            return Ok(None);
        };

        // A registration is bound to its redirect URI; re-register when
        // the callback port moved.
        if let (Some(expected), Some(actual)) = (redirect_uri, client.redirect_uri.as_deref()) {
            if expected != actual {
                return Ok(None);
            }
        }

        Ok(Some(client))
    }
}
