//! Chat backend abstraction for kestrel.
//!
//! This crate provides a unified streaming interface over the two chat
//! protocols kestrel speaks:
//!
//! - **Client-executed** ([`chat_completions`]): an OpenAI-style
//!   chat-completions stream; every tool call the model emits is executed
//!   by the client before the next invocation.
//! - **Server-assisted** ([`responses`]): the request declares remote tool
//!   sources, and the stream may carry tool responses the backend already
//!   executed plus out-of-band approval requests answered on the stream.
//!
//! Both produce the same typed [`StreamEvent`] sequence, so the chat loop
//! is protocol-agnostic.

pub mod chat_completions;
pub mod error;
pub mod message;
pub mod model;
pub mod responses;
pub mod stream;

pub use chat_completions::ChatCompletionsProvider;
pub use error::{ProviderError, ProviderResult};
pub use message::{ContentPart, ImageSource, Message, Role};
pub use model::ModelInfo;
pub use responses::ResponsesProvider;
pub use stream::{FinishReason, StreamEvent, Usage};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A tool definition offered to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// JSON Schema for the tool parameters.
    pub parameters: Value,
}

/// A remote tool source declared to a server-assisted backend.
///
/// The backend connects to these servers itself and executes their tools
/// server-side; the client only sees pre-calculated responses and
/// approval requests.
#[derive(Debug, Clone)]
pub struct RemoteToolSource {
    /// Identifier the stream uses to attribute tool activity.
    pub server_id: String,
    /// MCP server URL.
    pub url: String,
    /// Bearer token for the server, if it requires one.
    pub auth_token: Option<String>,
}

/// The client's answer to a server-side approval request.
#[derive(Debug, Clone)]
pub struct ApprovalReply {
    /// Id of the approval request being answered.
    pub id: String,
    /// Whether the tool may run.
    pub approve: bool,
}

/// Options for one streaming generation step.
#[derive(Debug, Default)]
pub struct GenerateOptions {
    /// Temperature for sampling (0.0-1.0).
    pub temperature: Option<f32>,
    /// Top-p (nucleus) sampling.
    pub top_p: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// System prompt.
    pub system: Option<String>,
    /// Tools executed locally by the client.
    pub tools: Vec<ToolDefinition>,
    /// Remote tool sources for server-assisted mode.
    pub remote_tool_sources: Vec<RemoteToolSource>,
    /// Approval replies flowing back to a server-assisted stream.
    ///
    /// The coordinator keeps the sending half; a provider that never asks
    /// for approvals ignores this.
    pub approval_replies: Option<mpsc::UnboundedReceiver<ApprovalReply>>,
    /// Cancellation token; cancelling closes the underlying stream.
    pub abort: Option<tokio_util::sync::CancellationToken>,
}

/// The main trait for streaming chat backends.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate one streaming response step.
    ///
    /// Returns a lazy, finite, non-restartable sequence of typed events.
    async fn generate(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> ProviderResult<BoxStream<'static, ProviderResult<StreamEvent>>>;

    /// Get information about this model.
    fn model_info(&self) -> &ModelInfo;

    /// Get the backend ID (e.g. "chat-completions", "responses").
    fn backend_id(&self) -> &str;
}

/// A boxed language model for dynamic dispatch.
pub type BoxedLanguageModel = Arc<dyn LanguageModel>;
