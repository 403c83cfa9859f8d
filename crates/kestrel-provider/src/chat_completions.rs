//! Client-executed chat backend.
//!
//! Speaks the OpenAI-compatible `/chat/completions` streaming protocol.
//! Only locally executed tools are offered; every tool call the model
//! emits comes back to the client for execution.

use crate::{
    error::ProviderError,
    message::{ContentPart, Message, Role},
    model::ModelInfo,
    stream::{FinishReason, StreamEvent, Usage},
    GenerateOptions, LanguageModel, ProviderResult, ToolDefinition,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

/// Client-executed chat provider.
pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    base_url: String,
    model: ModelInfo,
}

impl ChatCompletionsProvider {
    /// Create a new provider against a chat-completions compatible API.
    pub fn new(api_key: &str, base_url: &str, model: ModelInfo) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| ProviderError::invalid_api_key("chat-completions"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::internal(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    /// Convert conversation messages to the wire format.
    fn convert_messages(messages: &[Message], system: Option<&str>) -> Vec<Value> {
        let mut result = Vec::new();

        if let Some(sys) = system {
            result.push(json!({
                "role": "system",
                "content": sys
            }));
        }

        for msg in messages {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
                Role::System => "system",
            };

            let content = convert_content(&msg.content);

            // Tool results become one wire message per result, correlated
            // by tool_call_id.
            if msg.role == Role::Tool {
                for part in &msg.content {
                    if let ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = part
                    {
                        result.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_use_id,
                            "content": content
                        }));
                    }
                }
            } else if !content.is_null() || msg.role == Role::Assistant {
                let mut message = json!({
                    "role": role,
                    "content": content
                });

                if msg.role == Role::Assistant {
                    if let Some(tool_calls) = convert_tool_calls(&msg.content) {
                        message["tool_calls"] = tool_calls;
                    }
                }

                result.push(message);
            }
        }

        result
    }

    /// Convert tool definitions to the wire format.
    fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters
                    }
                })
            })
            .collect()
    }
}

/// Convert content parts to the wire format.
fn convert_content(parts: &[ContentPart]) -> Value {
    let content_parts: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({
                "type": "text",
                "text": text
            })),
            ContentPart::Image { source } => {
                let url = match source {
                    crate::message::ImageSource::Base64 { media_type, data } => {
                        format!("data:{};base64,{}", media_type, data)
                    }
                    crate::message::ImageSource::Url { url } => url.clone(),
                };
                Some(json!({
                    "type": "image_url",
                    "image_url": { "url": url }
                }))
            }
            _ => None,
        })
        .collect();

    if content_parts.len() == 1 {
        if let Some(text) = content_parts[0].get("text") {
            return text.clone();
        }
    }

    if content_parts.is_empty() {
        Value::Null
    } else {
        Value::Array(content_parts)
    }
}

/// Convert assistant tool calls to the wire format.
fn convert_tool_calls(parts: &[ContentPart]) -> Option<Value> {
    let calls: Vec<Value> = parts
        .iter()
        .filter_map(|part| {
            if let ContentPart::ToolUse { id, name, input } = part {
                Some(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input).unwrap_or_default()
                    }
                }))
            } else {
                None
            }
        })
        .collect();

    if calls.is_empty() {
        None
    } else {
        Some(Value::Array(calls))
    }
}

/// Chat completion request.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

/// Streaming chunk.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[async_trait]
impl LanguageModel for ChatCompletionsProvider {
    async fn generate(
        &self,
        messages: Vec<Message>,
        options: GenerateOptions,
    ) -> ProviderResult<BoxStream<'static, ProviderResult<StreamEvent>>> {
        let request = ChatRequest {
            model: self.model.id.clone(),
            messages: Self::convert_messages(&messages, options.system.as_deref()),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            tools: Self::convert_tools(&options.tools),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        debug!(
            model = %self.model.id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "Sending chat-completions request"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Chat-completions request failed");

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited { retry_after: None });
            }

            return Err(ProviderError::api_error(status.as_u16(), error_text));
        }

        let byte_stream = response.bytes_stream();
        let abort = options.abort.clone();

        Ok(Box::pin(try_stream! {
            use futures::StreamExt;
            use tokio::io::AsyncBufReadExt;
            use tokio_util::io::StreamReader;

            let reader = StreamReader::new(
                byte_stream.map(|r| r.map_err(std::io::Error::other))
            );
            let mut lines = reader.lines();

            // Tool calls under construction, indexed by wire position.
            let mut tool_calls: Vec<(String, String, String)> = Vec::new();
            let mut text_started = false;
            let mut reasoning_started = false;

            while let Some(line) = lines.next_line().await? {
                if let Some(ref token) = abort {
                    if token.is_cancelled() {
                        Err(ProviderError::Cancelled)?;
                    }
                }

                let line = line.trim();

                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }

                let data = line.strip_prefix("data: ").unwrap_or(line);
                if data.is_empty() {
                    continue;
                }

                let chunk: ChatChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        trace!(error = %e, data = %data, "Failed to parse chunk");
                        continue;
                    }
                };

                for choice in &chunk.choices {
                    if let Some(reasoning) = &choice.delta.reasoning {
                        if !reasoning.is_empty() {
                            if !reasoning_started {
                                yield StreamEvent::ReasoningStart;
                                reasoning_started = true;
                            }
                            yield StreamEvent::ReasoningDelta(reasoning.clone());
                        }
                    }

                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty() {
                            if reasoning_started {
                                yield StreamEvent::ReasoningEnd;
                                reasoning_started = false;
                            }
                            if !text_started {
                                yield StreamEvent::ContentStart;
                                text_started = true;
                            }
                            yield StreamEvent::ContentDelta(content.clone());
                        }
                    }

                    if let Some(tool_deltas) = &choice.delta.tool_calls {
                        for delta in tool_deltas {
                            while tool_calls.len() <= delta.index {
                                tool_calls.push((String::new(), String::new(), String::new()));
                            }

                            let call = &mut tool_calls[delta.index];

                            if let Some(id) = &delta.id {
                                call.0 = id.clone();
                            }

                            if let Some(func) = &delta.function {
                                if let Some(name) = &func.name {
                                    call.1 = name.clone();
                                    yield StreamEvent::ToolCallStart {
                                        id: call.0.clone(),
                                        name: name.clone(),
                                    };
                                }
                                if let Some(args) = &func.arguments {
                                    call.2.push_str(args);
                                    yield StreamEvent::ToolCallDelta {
                                        id: call.0.clone(),
                                        delta: args.clone(),
                                    };
                                }
                            }
                        }
                    }

                    if let Some(reason) = &choice.finish_reason {
                        if reasoning_started {
                            yield StreamEvent::ReasoningEnd;
                            reasoning_started = false;
                        }
                        if text_started {
                            yield StreamEvent::ContentEnd;
                            text_started = false;
                        }

                        for (id, name, args) in tool_calls.drain(..) {
                            if !id.is_empty() && !name.is_empty() {
                                yield StreamEvent::ToolCallComplete {
                                    id,
                                    name,
                                    arguments: args,
                                };
                            }
                        }

                        let usage = chunk
                            .usage
                            .as_ref()
                            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
                            .unwrap_or_default();

                        yield StreamEvent::TurnComplete {
                            usage,
                            finish_reason: FinishReason::from_completions(reason),
                        };
                    }
                }
            }
        }))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    fn backend_id(&self) -> &str {
        "chat-completions"
    }
}
