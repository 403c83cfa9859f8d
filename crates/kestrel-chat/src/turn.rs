//! Chat turn coordinator.
//!
//! Drives one conversation turn against either chat protocol: stream one
//! assistant step, merge its deltas into a coherent message, resolve every
//! outstanding tool call (locally through the gateway, or by answering
//! approval requests on the stream), append the results, and re-invoke
//! until a step produces no tool calls or the iteration cap is hit.

use crate::error::{ChatError, ChatResult};
use crate::gateway::{ToolCallRequest, ToolGateway};
use crate::prune;
use kestrel_provider::{
    ApprovalReply, BoxedLanguageModel, ContentPart, GenerateOptions, Message, ProviderError,
    RemoteToolSource, Role, StreamEvent, ToolDefinition, Usage,
};
use kestrel_mcp::TransportKind;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard upper bound on model invocations per turn.
pub const MAX_TURN_STEPS: usize = 12;

/// Notice appended when the iteration cap cuts a turn short.
pub const TURN_TRUNCATION_NOTICE: &str =
    "[Tool-call limit reached for this turn; stopping here. Send another message to continue.]";

/// Which chat protocol drives the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// Tool calls are executed locally through the gateway.
    ClientExecuted,
    /// Remote tool sources are declared to the backend, which executes
    /// them server-side; only stdio-local tools are offered for local
    /// execution.
    ServerAssisted,
}

/// Per-conversation turn settings.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub mode: ChatMode,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub max_steps: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            mode: ChatMode::ClientExecuted,
            system: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_steps: MAX_TURN_STEPS,
        }
    }
}

/// Incremental updates surfaced to the UI layer during a turn.
#[derive(Debug, Clone)]
pub enum TurnUpdate {
    ContentDelta(String),
    ReasoningDelta(String),
    ToolStarted {
        id: String,
        name: String,
    },
    ToolCompleted {
        id: String,
        success: bool,
        output: String,
    },
    Status(String),
}

/// The result of one completed turn.
#[derive(Debug)]
pub struct TurnOutcome {
    /// Final assistant text.
    pub text: String,
    /// Messages appended to the history this turn (user, assistant, tool).
    pub messages: Vec<Message>,
    /// Accumulated token usage across all steps.
    pub usage: Usage,
    /// Whether the iteration cap cut the turn short.
    pub truncated: bool,
}

/// Everything merged from one streamed assistant step.
#[derive(Default)]
struct StepAccumulator {
    text: String,
    reasoning: String,
    /// Tool calls under construction: (id, name, accumulated args).
    tool_calls: Vec<(String, String, String)>,
    /// Server-executed tool responses, consumed as-is.
    pre_calculated: Vec<(String, String, String, bool)>,
}

/// Coordinator for one conversation.
///
/// Turns are single-flight: submitting a message while a turn is running
/// fails with [`ChatError::TurnInProgress`]; the busy state is observable
/// through [`is_busy`].
///
/// [`is_busy`]: ChatCoordinator::is_busy
pub struct ChatCoordinator {
    provider: BoxedLanguageModel,
    gateway: Arc<ToolGateway>,
    config: RwLock<TurnConfig>,
    history: RwLock<Vec<Message>>,
    busy: AtomicBool,
    cancel: std::sync::Mutex<CancellationToken>,
}

impl ChatCoordinator {
    /// Create a coordinator.
    pub fn new(provider: BoxedLanguageModel, gateway: Arc<ToolGateway>, config: TurnConfig) -> Self {
        Self {
            provider,
            gateway,
            config: RwLock::new(config),
            history: RwLock::new(Vec::new()),
            busy: AtomicBool::new(false),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Whether a turn is currently running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Abort the running turn, stopping the underlying stream read.
    pub fn abort(&self) {
        self.cancel.lock().expect("cancel lock poisoned").cancel();
    }

    /// The conversation history.
    pub async fn history(&self) -> Vec<Message> {
        self.history.read().await.clone()
    }

    /// Clear the conversation history.
    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }

    /// Replace the turn configuration.
    pub async fn set_config(&self, config: TurnConfig) {
        *self.config.write().await = config;
    }

    /// Submit a user message and drive the turn to completion.
    ///
    /// Partial content is preserved in the history even when the turn
    /// fails or is aborted.
    pub async fn send_message(
        &self,
        user_text: impl Into<String>,
        update_tx: Option<mpsc::UnboundedSender<TurnUpdate>>,
    ) -> ChatResult<TurnOutcome> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(ChatError::TurnInProgress);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel lock poisoned") = cancel.clone();

        let result = self
            .run_turn(user_text.into(), cancel, update_tx.as_ref())
            .await;

        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn run_turn(
        &self,
        user_text: String,
        cancel: CancellationToken,
        update_tx: Option<&mpsc::UnboundedSender<TurnUpdate>>,
    ) -> ChatResult<TurnOutcome> {
        let turn_id = kestrel_util::Identifier::turn();
        let config = self.config.read().await.clone();
        let context_window = self.provider.model_info().context_window;

        info!(turn = %turn_id, mode = ?config.mode, "Turn started");

        let mut messages = self.history.read().await.clone();
        let user_msg = Message::user(user_text);
        messages.push(user_msg.clone());

        let mut appended = vec![user_msg];
        let mut total_usage = Usage::default();
        let mut final_text = String::new();
        let mut truncated = false;
        let mut steps = 0usize;

        let failure: Option<ChatError> = loop {
            if cancel.is_cancelled() {
                break Some(ChatError::Cancelled);
            }

            if steps >= config.max_steps {
                warn!(steps, "Turn step limit reached");
                let notice = Message::assistant(TURN_TRUNCATION_NOTICE);
                messages.push(notice.clone());
                appended.push(notice);
                truncated = true;
                break None;
            }
            steps += 1;

            prune::prune_messages(&mut messages, context_window);

            let tools = self.tool_definitions(config.mode).await;
            let (reply_tx, options) = self
                .build_options(&config, tools, cancel.clone())
                .await;

            debug!(
                step = steps,
                message_count = messages.len(),
                "Invoking chat backend"
            );

            let stream = match self.provider.generate(messages.clone(), options).await {
                Ok(stream) => stream,
                Err(e) => break Some(map_provider_error(e)),
            };
            tokio::pin!(stream);

            let mut step = StepAccumulator::default();
            let mut stream_failure: Option<ChatError> = None;

            loop {
                // Abort must stop the stream read even when no event is
                // in flight.
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        stream_failure = Some(ChatError::Cancelled);
                        break;
                    }
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        stream_failure = Some(map_provider_error(e));
                        break;
                    }
                };

                match event {
                    StreamEvent::ContentStart | StreamEvent::ContentEnd => {}
                    StreamEvent::ContentDelta(delta) => {
                        step.text.push_str(&delta);
                        send_update(update_tx, TurnUpdate::ContentDelta(delta));
                    }
                    StreamEvent::ReasoningStart | StreamEvent::ReasoningEnd => {}
                    StreamEvent::ReasoningDelta(delta) => {
                        step.reasoning.push_str(&delta);
                        send_update(update_tx, TurnUpdate::ReasoningDelta(delta));
                    }
                    StreamEvent::ToolCallStart { id, name } => {
                        step.tool_calls.push((id, name, String::new()));
                    }
                    StreamEvent::ToolCallDelta { id, delta } => {
                        if let Some(call) = step.tool_calls.iter_mut().find(|c| c.0 == id) {
                            call.2.push_str(&delta);
                        }
                    }
                    StreamEvent::ToolCallComplete {
                        id,
                        name,
                        arguments,
                    } => {
                        if let Some(call) = step.tool_calls.iter_mut().find(|c| c.0 == id) {
                            call.1 = name;
                            call.2 = arguments;
                        } else {
                            step.tool_calls.push((id, name, arguments));
                        }
                    }
                    StreamEvent::PreCalculatedToolResponse {
                        id,
                        name,
                        output,
                        is_error,
                    } => {
                        // Executed server-side; never run it again here.
                        send_update(
                            update_tx,
                            TurnUpdate::ToolCompleted {
                                id: id.clone(),
                                success: !is_error,
                                output: output.clone(),
                            },
                        );
                        step.pre_calculated.push((id, name, output, is_error));
                    }
                    StreamEvent::ApprovalRequest { id, tool_name } => {
                        // Same approval logic as local execution, answered
                        // on the stream instead of invoking a transport.
                        let approve = self.gateway.resolve_approval(&tool_name).await;
                        info!(tool = %tool_name, approve, "Answering server-side approval request");
                        if let Some(ref tx) = reply_tx {
                            let _ = tx.send(ApprovalReply { id, approve });
                        }
                    }
                    StreamEvent::TurnComplete { usage, .. } => {
                        total_usage.merge(&usage);
                    }
                    StreamEvent::Error(message) => {
                        warn!(error = %message, "In-band stream error");
                    }
                }
            }

            // The backend executed these calls itself; keep them out of
            // the local dispatch.
            let server_executed: HashSet<String> = step
                .pre_calculated
                .iter()
                .map(|(id, ..)| id.clone())
                .collect();
            let (server_calls, local_calls): (Vec<_>, Vec<_>) = step
                .tool_calls
                .into_iter()
                .partition(|(id, ..)| server_executed.contains(id));

            // Merge the step into a coherent assistant message.
            let mut content = Vec::new();
            if !step.reasoning.is_empty() {
                content.push(ContentPart::Thinking {
                    text: step.reasoning,
                });
            }
            if !step.text.is_empty() {
                final_text = step.text.clone();
                content.push(ContentPart::text(step.text));
            }
            for (id, name, args) in server_calls.iter().chain(local_calls.iter()) {
                content.push(ContentPart::tool_use(
                    id.as_str(),
                    name.as_str(),
                    parse_arguments(args),
                ));
            }
            // Server-side calls the stream never announced still need a
            // tool_use anchor so every tool result stays correlated.
            for (id, name, ..) in &step.pre_calculated {
                if !server_calls.iter().any(|(call_id, ..)| call_id == id) {
                    content.push(ContentPart::tool_use(
                        id.as_str(),
                        name.as_str(),
                        serde_json::Value::Null,
                    ));
                }
            }

            if !content.is_empty() {
                let assistant = Message {
                    role: Role::Assistant,
                    content,
                };
                messages.push(assistant.clone());
                appended.push(assistant);
            }

            // Pre-calculated responses append as-is.
            for (id, _name, output, is_error) in step.pre_calculated {
                let message = if is_error {
                    Message::tool_error(id, output)
                } else {
                    Message::tool_result(id, output)
                };
                messages.push(message.clone());
                appended.push(message);
            }

            if let Some(e) = stream_failure {
                break Some(e);
            }

            if local_calls.is_empty() {
                break None;
            }

            // Resolve every local tool call before the next invocation.
            let requests: Vec<ToolCallRequest> = local_calls
                .into_iter()
                .map(|(id, name, args)| {
                    send_update(
                        update_tx,
                        TurnUpdate::ToolStarted {
                            id: id.clone(),
                            name: name.clone(),
                        },
                    );
                    ToolCallRequest {
                        id,
                        name,
                        arguments: parse_arguments(&args),
                    }
                })
                .collect();

            let outcomes = self.gateway.execute_batch(requests).await;
            for outcome in outcomes {
                send_update(
                    update_tx,
                    TurnUpdate::ToolCompleted {
                        id: outcome.id.clone(),
                        success: !outcome.is_error,
                        output: outcome.output.clone(),
                    },
                );
                let message = outcome.into_message();
                messages.push(message.clone());
                appended.push(message);
            }
        };

        // Commit everything merged so far; partial content survives a
        // failed or aborted turn.
        self.history.write().await.extend(appended.iter().cloned());

        match &failure {
            Some(error) => warn!(turn = %turn_id, error = %error, "Turn failed"),
            None => info!(turn = %turn_id, steps, truncated, "Turn complete"),
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(TurnOutcome {
                text: final_text,
                messages: appended,
                usage: total_usage,
                truncated,
            }),
        }
    }

    /// Tools offered to the model for local execution.
    ///
    /// Client-executed mode offers the whole catalog; server-assisted
    /// mode offers only stdio-local tools (remote servers are declared
    /// as sources instead).
    async fn tool_definitions(&self, mode: ChatMode) -> Vec<ToolDefinition> {
        let router = self.gateway.router();
        let mut definitions = Vec::new();

        for tool in router.tools().await {
            if mode == ChatMode::ServerAssisted {
                let kind = router.server_kind(&tool.server_id).await;
                if kind != Some(TransportKind::Stdio) {
                    continue;
                }
            }

            definitions.push(ToolDefinition {
                name: tool.name,
                description: tool.description.unwrap_or_default(),
                parameters: tool
                    .input_schema
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
            });
        }

        definitions
    }

    async fn build_options(
        &self,
        config: &TurnConfig,
        tools: Vec<ToolDefinition>,
        cancel: CancellationToken,
    ) -> (
        Option<mpsc::UnboundedSender<ApprovalReply>>,
        GenerateOptions,
    ) {
        let mut options = GenerateOptions {
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
            system: config.system.clone(),
            tools,
            abort: Some(cancel),
            ..Default::default()
        };

        match config.mode {
            ChatMode::ClientExecuted => (None, options),
            ChatMode::ServerAssisted => {
                options.remote_tool_sources = self
                    .gateway
                    .router()
                    .remote_servers()
                    .await
                    .into_iter()
                    .map(|server| RemoteToolSource {
                        server_id: server.server_id,
                        url: server.url,
                        auth_token: server.auth_token,
                    })
                    .collect();

                let (tx, rx) = mpsc::unbounded_channel();
                options.approval_replies = Some(rx);
                (Some(tx), options)
            }
        }
    }
}

fn send_update(update_tx: Option<&mpsc::UnboundedSender<TurnUpdate>>, update: TurnUpdate) {
    if let Some(tx) = update_tx {
        let _ = tx.send(update);
    }
}

fn parse_arguments(args: &str) -> serde_json::Value {
    if args.trim().is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_str(args).unwrap_or(serde_json::Value::Null)
}

fn map_provider_error(error: ProviderError) -> ChatError {
    match error {
        ProviderError::Cancelled => ChatError::Cancelled,
        ProviderError::StreamProtocol(message) => ChatError::StreamProtocol(message),
        other => ChatError::Provider(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert_eq!(
            parse_arguments("{\"q\": 1}"),
            serde_json::json!({"q": 1})
        );
        assert_eq!(parse_arguments(""), serde_json::Value::Null);
        assert_eq!(parse_arguments("not json"), serde_json::Value::Null);
    }

    #[test]
    fn test_map_provider_error() {
        assert!(matches!(
            map_provider_error(ProviderError::Cancelled),
            ChatError::Cancelled
        ));
        assert!(matches!(
            map_provider_error(ProviderError::StreamProtocol("x".to_string())),
            ChatError::StreamProtocol(_)
        ));
        assert!(matches!(
            map_provider_error(ProviderError::StreamInterrupted),
            ChatError::Provider(_)
        ));
    }

    #[test]
    fn test_turn_config_default() {
        let config = TurnConfig::default();
        assert_eq!(config.mode, ChatMode::ClientExecuted);
        assert_eq!(config.max_steps, MAX_TURN_STEPS);
        assert!(config.system.is_none());
    }
}
