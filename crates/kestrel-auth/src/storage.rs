//! Credential storage implementation.

use crate::error::{AuthError, AuthResult};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Secure key-value storage for credentials and approval records.
///
/// Provides thread-safe access to stored values with automatic file
/// permission management on Unix systems. Values are arbitrary JSON;
/// callers own their own record shapes.
pub struct CredentialStore {
    /// Path to the credential file.
    path: PathBuf,
    /// In-memory cache of stored data.
    cache: RwLock<Option<HashMap<String, Value>>>,
}

impl CredentialStore {
    /// Create a new store using the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_credentials_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self {
            path,
            cache: RwLock::new(None),
        })
    }

    /// Create a store with a custom path.
    ///
    /// Useful for testing or custom configurations.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }

    /// Get the path to the credential file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Get the value stored under a key.
    ///
    /// Returns `None` if the key is not present.
    pub async fn get(&self, key: &str) -> AuthResult<Option<Value>> {
        let all = self.all().await?;
        Ok(all.get(key).cloned())
    }

    /// Store a value under a key.
    ///
    /// This will create the credential file if it doesn't exist.
    pub async fn set(&self, key: &str, value: Value) -> AuthResult<()> {
        debug!(key = %key, "Storing credential entry");

        let mut all = self.all().await?;
        all.insert(key.to_string(), value);
        self.write_all(&all).await?;

        // Invalidate cache
        *self.cache.write().await = None;

        Ok(())
    }

    /// Remove the value stored under a key.
    ///
    /// Returns `true` if a value was removed, `false` if it didn't exist.
    pub async fn remove(&self, key: &str) -> AuthResult<bool> {
        debug!(key = %key, "Removing credential entry");

        let mut all = self.all().await?;
        let existed = all.remove(key).is_some();

        if existed {
            self.write_all(&all).await?;
            // Invalidate cache
            *self.cache.write().await = None;
        }

        Ok(existed)
    }

    /// Get all stored entries.
    pub async fn all(&self) -> AuthResult<HashMap<String, Value>> {
        // Check cache first
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        // Read from file
        let data = self.read_all().await?;

        // Update cache
        *self.cache.write().await = Some(data.clone());

        Ok(data)
    }

    /// Check if a key is present.
    pub async fn has(&self, key: &str) -> AuthResult<bool> {
        let all = self.all().await?;
        Ok(all.contains_key(key))
    }

    /// Clear all stored entries.
    pub async fn clear(&self) -> AuthResult<()> {
        debug!("Clearing credential store");
        self.write_all(&HashMap::new()).await?;
        *self.cache.write().await = None;
        Ok(())
    }

    /// Read all entries from the file.
    async fn read_all(&self) -> AuthResult<HashMap<String, Value>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;

        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }

        Ok(serde_json::from_str(&content)?)
    }

    /// Write all entries to the file.
    async fn write_all(&self, data: &HashMap<String, Value>) -> AuthResult<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&self.path, &content).await?;

        // Set restrictive permissions on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms)
                .await
                .map_err(|e| {
                    AuthError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        self.path, e
                    ))
                })?;
        }

        debug!(path = ?self.path, "Wrote credential file");
        Ok(())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> (CredentialStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::with_path(path);
        (store, dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _dir) = test_store();

        store.set("api_key:backend", json!("sk-test")).await.unwrap();

        let value = store.get("api_key:backend").await.unwrap();
        assert_eq!(value, Some(json!("sk-test")));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _dir) = test_store();

        let value = store.get("nonexistent").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_structured_value_roundtrip() {
        let (store, _dir) = test_store();

        let tokens = json!({
            "accessToken": "abc",
            "refreshToken": "def",
            "expiresAt": 1234567890
        });
        store.set("oauth:docs", tokens.clone()).await.unwrap();

        let value = store.get("oauth:docs").await.unwrap();
        assert_eq!(value, Some(tokens));
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _dir) = test_store();

        store.set("key", json!(true)).await.unwrap();

        let removed = store.remove("key").await.unwrap();
        assert!(removed);

        let value = store.get("key").await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_remove_nonexistent() {
        let (store, _dir) = test_store();

        let removed = store.remove("nonexistent").await.unwrap();
        assert!(!removed);
    }

    #[tokio::test]
    async fn test_has() {
        let (store, _dir) = test_store();

        store.set("present", json!(1)).await.unwrap();

        assert!(store.has("present").await.unwrap());
        assert!(!store.has("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _dir) = test_store();

        store.set("a", json!(1)).await.unwrap();
        store.set("b", json!(2)).await.unwrap();

        store.clear().await.unwrap();

        let all = store.all().await.unwrap();
        assert!(all.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (store, _dir) = test_store();

        store.set("test", json!("secret")).await.unwrap();

        let metadata = std::fs::metadata(store.path()).unwrap();
        let mode = metadata.permissions().mode();

        // Only owner may read/write (0600)
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");

        // Write with one instance
        {
            let store = CredentialStore::with_path(path.clone());
            store.set("key", json!("value")).await.unwrap();
        }

        // Read with a fresh instance
        {
            let store = CredentialStore::with_path(path);
            let value = store.get("key").await.unwrap();
            assert_eq!(value, Some(json!("value")));
        }
    }

    #[tokio::test]
    async fn test_empty_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "  \n").await.unwrap();

        let store = CredentialStore::with_path(path);
        let all = store.all().await.unwrap();
        assert!(all.is_empty());
    }
}
