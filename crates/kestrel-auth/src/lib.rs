//! Credential storage for kestrel.
//!
//! This crate provides a simple key-value store for secrets and small
//! per-user records: OAuth tokens for MCP servers, chat backend API keys,
//! and persisted tool approval decisions. Values are arbitrary JSON so
//! callers can store typed records without this crate knowing about them.
//!
//! # Storage Location
//!
//! Credentials are stored in a platform-specific data directory:
//! - Linux: `~/.local/share/kestrel/credentials.json`
//! - macOS: `~/Library/Application Support/kestrel/credentials.json`
//! - Windows: `%APPDATA%/kestrel/credentials.json`
//!
//! The file is created with restrictive permissions (0600 on Unix).
//!
//! # Example
//!
//! ```no_run
//! use kestrel_auth::CredentialStore;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CredentialStore::new()?;
//!
//!     store.set("api_key:backend", json!("sk-...")).await?;
//!
//!     if let Some(key) = store.get("api_key:backend").await? {
//!         println!("key: {key}");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod error;
mod storage;

pub use error::{AuthError, AuthResult};
pub use storage::CredentialStore;

/// Get the default credential file path for the current platform.
///
/// Returns `None` if the data directory cannot be determined.
pub fn default_credentials_path() -> Option<std::path::PathBuf> {
    dirs::data_dir().map(|p| p.join("kestrel").join("credentials.json"))
}

/// Get the current time in seconds since Unix epoch.
pub fn current_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
