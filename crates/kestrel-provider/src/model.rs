//! Model metadata.

use serde::{Deserialize, Serialize};

/// Information about a chat model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier sent to the backend.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Context window in tokens.
    pub context_window: u32,
    /// Maximum output tokens.
    pub max_output: u32,
}

impl ModelInfo {
    /// Create model info with the given limits.
    pub fn new(id: impl Into<String>, context_window: u32, max_output: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            context_window,
            max_output,
        }
    }
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self::new("unknown", 128_000, 8_192)
    }
}
