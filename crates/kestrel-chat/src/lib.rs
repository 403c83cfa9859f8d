//! Chat turn coordination for kestrel.
//!
//! This crate ties the MCP layer and the chat backends together:
//!
//! - [`approval`] - the tri-state approval gate and its persisted scopes
//! - [`gateway`] - tool execution with approval, timeout and truncation
//! - [`prune`] - context-window pruning in whole message groups
//! - [`turn`] - the streaming turn loop over both chat protocols
//!
//! Tool execution failures are never fatal here: they become tool-role
//! messages and the conversation continues. Only turn-level protocol
//! corruption surfaces as an error, with partial content preserved.

pub mod approval;
pub mod error;
pub mod gateway;
pub mod prune;
pub mod turn;

pub use approval::{ApprovalChoice, ApprovalHandler, ApprovalPolicy, TOOL_DENIED_MARKER};
pub use error::{ChatError, ChatResult};
pub use gateway::{
    ToolCallOutcome, ToolCallRequest, ToolGateway, ToolRouter, MAX_TOOL_OUTPUT_CHARS,
    TOOL_CALL_TIMEOUT_SECS,
};
pub use prune::{estimate_tokens, prune_messages, CONTEXT_TARGET_FRACTION};
pub use turn::{
    ChatCoordinator, ChatMode, TurnConfig, TurnOutcome, TurnUpdate, MAX_TURN_STEPS,
    TURN_TRUNCATION_NOTICE,
};
