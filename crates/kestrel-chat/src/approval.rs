//! Approval gate for tool execution.
//!
//! Every tool call passes the approval policy before it reaches a
//! transport. Persisted scopes (auto-approve-all, per-tool "always") are
//! read through on each request; anything else suspends on the external
//! decision handler. Persistence of "always" decisions belongs to the
//! handler's owner (the UI layer), not to this module.

use async_trait::async_trait;
use kestrel_auth::CredentialStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Stable marker embedded in denial results so the model (and tests) can
/// recognize a user denial.
pub const TOOL_DENIED_MARKER: &str = "Tool execution denied by user";

/// Credential store key for the global auto-approve scope.
const AUTO_APPROVE_ALL_KEY: &str = "approval:auto_approve_all";

fn tool_key(tool_name: &str) -> String {
    format!("approval:tool:{tool_name}")
}

/// A decision from the external approval surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalChoice {
    /// Allow this call only.
    ApproveOnce,
    /// Allow this call and future calls of the same tool.
    ApproveAlways,
    /// Refuse the call.
    Deny,
}

/// The decision function supplied by the UI layer.
///
/// Invoked from the gateway's suspension point when no persisted scope
/// matches; only the call awaiting the decision blocks on it.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    /// Decide whether the named tool may run.
    async fn decide(&self, tool_name: &str) -> ApprovalChoice;
}

/// A handler that denies everything. Useful as a safe default and in
/// non-interactive contexts.
pub struct DenyAllHandler;

#[async_trait]
impl ApprovalHandler for DenyAllHandler {
    async fn decide(&self, _tool_name: &str) -> ApprovalChoice {
        ApprovalChoice::Deny
    }
}

/// Read-through view of persisted approval scopes.
#[derive(Clone)]
pub struct ApprovalPolicy {
    store: Arc<CredentialStore>,
}

impl ApprovalPolicy {
    /// Create a policy over the credential store.
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    /// Whether a persisted scope already approves this tool.
    pub async fn is_auto_approved(&self, tool_name: &str) -> bool {
        // Global scope first.
        if let Ok(Some(value)) = self.store.get(AUTO_APPROVE_ALL_KEY).await {
            if value.as_bool() == Some(true) {
                return true;
            }
        }

        // Per-tool "always" scope.
        if let Ok(Some(value)) = self.store.get(&tool_key(tool_name)).await {
            if value.as_bool() == Some(true) {
                return true;
            }
        }

        false
    }

    /// Persist an "always" approval for a tool.
    ///
    /// Offered for the approval handler's owner; the gateway itself never
    /// calls this.
    pub async fn remember_always(&self, tool_name: &str) {
        debug!(tool = %tool_name, "Persisting always-approval");
        let _ = self
            .store
            .set(&tool_key(tool_name), serde_json::Value::Bool(true))
            .await;
    }

    /// Enable or disable the global auto-approve scope.
    pub async fn set_auto_approve_all(&self, enabled: bool) {
        let _ = self
            .store
            .set(AUTO_APPROVE_ALL_KEY, serde_json::Value::Bool(enabled))
            .await;
    }

    /// Drop a persisted per-tool approval.
    pub async fn forget(&self, tool_name: &str) {
        let _ = self.store.remove(&tool_key(tool_name)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_policy() -> (ApprovalPolicy, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::with_path(dir.path().join("creds.json")));
        (ApprovalPolicy::new(store), dir)
    }

    #[tokio::test]
    async fn test_default_is_not_approved() {
        let (policy, _dir) = test_policy();
        assert!(!policy.is_auto_approved("search").await);
    }

    #[tokio::test]
    async fn test_remember_always() {
        let (policy, _dir) = test_policy();

        policy.remember_always("search").await;
        assert!(policy.is_auto_approved("search").await);
        assert!(!policy.is_auto_approved("other").await);
    }

    #[tokio::test]
    async fn test_auto_approve_all() {
        let (policy, _dir) = test_policy();

        policy.set_auto_approve_all(true).await;
        assert!(policy.is_auto_approved("anything").await);

        policy.set_auto_approve_all(false).await;
        assert!(!policy.is_auto_approved("anything").await);
    }

    #[tokio::test]
    async fn test_forget() {
        let (policy, _dir) = test_policy();

        policy.remember_always("search").await;
        policy.forget("search").await;
        assert!(!policy.is_auto_approved("search").await);
    }

    #[tokio::test]
    async fn test_deny_all_handler() {
        let handler = DenyAllHandler;
        assert_eq!(handler.decide("anything").await, ApprovalChoice::Deny);
    }

    #[test]
    fn test_choice_serialization() {
        let json = serde_json::to_string(&ApprovalChoice::ApproveAlways).unwrap();
        assert_eq!(json, "\"approve-always\"");
        let parsed: ApprovalChoice = serde_json::from_str("\"deny\"").unwrap();
        assert_eq!(parsed, ApprovalChoice::Deny);
    }
}
