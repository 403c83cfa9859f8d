//! Server-assisted chat backend.
//!
//! Speaks the streaming responses protocol: the request declares remote
//! tool sources next to any locally executed tools, and the stream may
//! carry tool responses the backend already executed server-side
//! (`pre-calculated-tool-response`) plus out-of-band approval requests.
//! Approval decisions flow back to the backend over a side channel; the
//! tools themselves never run on the client.

use crate::{
    error::ProviderError,
    message::{ContentPart, Message, Role},
    model::ModelInfo,
    stream::{FinishReason, StreamEvent, Usage},
    GenerateOptions, LanguageModel, ProviderResult, RemoteToolSource, ToolDefinition,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

/// Server-assisted chat provider.
pub struct ResponsesProvider {
    client: reqwest::Client,
    base_url: String,
    model: ModelInfo,
}

impl ResponsesProvider {
    /// Create a new provider against a responses-protocol API.
    pub fn new(api_key: &str, base_url: &str, model: ModelInfo) -> ProviderResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| ProviderError::invalid_api_key("responses"))?,
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

    /// Convert messages, splitting out the system prompt.
    fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system = None;
        let mut converted = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => match system {
                    None => system = Some(msg.text()),
                    Some(ref existing) => {
                        system = Some(format!("{existing}\n\n{}", msg.text()));
                    }
                },
                Role::User => converted.push(json!({
                    "role": "user",
                    "content": convert_content(&msg.content),
                })),
                Role::Assistant => converted.push(json!({
                    "role": "assistant",
                    "content": convert_content(&msg.content),
                })),
                // Tool results ride in user-role messages.
                Role::Tool => converted.push(json!({
                    "role": "user",
                    "content": convert_content(&msg.content),
                })),
            }
        }

        (system, converted)
    }

    /// Convert local tool definitions.
    fn convert_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.parameters,
                })
            })
            .collect()
    }

    /// Declare remote tool sources the backend connects to itself.
    fn convert_remote_sources(sources: &[RemoteToolSource]) -> Vec<serde_json::Value> {
        sources
            .iter()
            .map(|source| {
                let mut declared = json!({
                    "serverId": source.server_id,
                    "url": source.url,
                });
                if let Some(ref token) = source.auth_token {
                    declared["authorization"] = json!(format!("Bearer {token}"));
                }
                declared
            })
            .collect()
    }

    /// Extract one complete SSE event from the buffer.
    fn extract_sse_event(buffer: &mut String) -> Option<SseEvent> {
        let end = buffer.find("\n\n")?;
        let event_str = buffer[..end].to_string();
        buffer.drain(..end + 2);

        let mut event = SseEvent::default();

        for line in event_str.lines() {
            if let Some(data) = line.strip_prefix("event: ") {
                event.event = data.to_string();
            } else if let Some(data) = line.strip_prefix("data: ") {
                event.data = data.to_string();
            }
        }

        if event.event.is_empty() && event.data.is_empty() {
            None
        } else {
            Some(event)
        }
    }

    /// Parse one typed SSE event into a stream event.
    fn parse_sse_event(
        event: &SseEvent,
        tool_args: &mut std::collections::HashMap<String, String>,
    ) -> ProviderResult<Option<StreamEvent>> {
        match event.event.as_str() {
            "content-delta" => {
                let data: DeltaEvent = serde_json::from_str(&event.data)?;
                Ok(Some(StreamEvent::ContentDelta(data.delta)))
            }
            "reasoning-delta" => {
                let data: DeltaEvent = serde_json::from_str(&event.data)?;
                Ok(Some(StreamEvent::ReasoningDelta(data.delta)))
            }
            "tool-call-delta" => {
                let data: ToolCallDeltaEvent = serde_json::from_str(&event.data)?;
                // The first fragment for an id carries the tool name.
                if let Some(name) = data.name {
                    tool_args.insert(data.id.clone(), String::new());
                    return Ok(Some(StreamEvent::ToolCallStart { id: data.id, name }));
                }
                if let Some(delta) = data.delta {
                    tool_args
                        .entry(data.id.clone())
                        .or_default()
                        .push_str(&delta);
                    return Ok(Some(StreamEvent::ToolCallDelta { id: data.id, delta }));
                }
                Ok(None)
            }
            "tool-call-complete" => {
                let data: ToolCallCompleteEvent = serde_json::from_str(&event.data)?;
                let arguments = match data.arguments {
                    Some(args) => args,
                    // Fall back to the client-side accumulation.
                    None => tool_args.remove(&data.id).unwrap_or_default(),
                };
                Ok(Some(StreamEvent::ToolCallComplete {
                    id: data.id,
                    name: data.name,
                    arguments,
                }))
            }
            "pre-calculated-tool-response" => {
                let data: PreCalculatedEvent = serde_json::from_str(&event.data)?;
                Ok(Some(StreamEvent::PreCalculatedToolResponse {
                    id: data.id,
                    name: data.name,
                    output: data.output,
                    is_error: data.is_error,
                }))
            }
            "approval-request" => {
                let data: ApprovalRequestEvent = serde_json::from_str(&event.data)?;
                Ok(Some(StreamEvent::ApprovalRequest {
                    id: data.id,
                    tool_name: data.tool_name,
                }))
            }
            "turn-complete" => {
                let data: TurnCompleteEvent = serde_json::from_str(&event.data)?;
                Ok(Some(StreamEvent::TurnComplete {
                    usage: Usage::new(data.usage.input_tokens, data.usage.output_tokens),
                    finish_reason: FinishReason::from_responses(&data.stop_reason),
                }))
            }
            "error" => {
                let data: ErrorEvent = serde_json::from_str(&event.data)?;
                Err(ProviderError::stream_protocol(data.message))
            }
            "ping" => Ok(None),
            other => {
                debug!(event = %other, "Unknown SSE event");
                Ok(None)
            }
        }
    }
}

/// Convert content parts to wire blocks.
fn convert_content(content: &[ContentPart]) -> Vec<serde_json::Value> {
    content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
            ContentPart::Image { source } => match source {
                crate::message::ImageSource::Base64 { media_type, data } => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "mediaType": media_type,
                        "data": data
                    }
                }),
                crate::message::ImageSource::Url { url } => json!({
                    "type": "image",
                    "source": { "type": "url", "url": url }
                }),
            },
            ContentPart::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input
            }),
            ContentPart::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "toolUseId": tool_use_id,
                "content": content,
                "isError": is_error.unwrap_or(false)
            }),
            ContentPart::Thinking { text } => json!({ "type": "thinking", "thinking": text }),
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponsesRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remote_tool_sources: Vec<serde_json::Value>,
    stream: bool,
}

#[derive(Debug, Default)]
struct SseEvent {
    event: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct DeltaEvent {
    delta: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallDeltaEvent {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallCompleteEvent {
    id: String,
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreCalculatedEvent {
    id: String,
    name: String,
    output: String,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRequestEvent {
    id: String,
    tool_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnCompleteEvent {
    usage: UsageEvent,
    stop_reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageEvent {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    message: String,
}

#[async_trait]
impl LanguageModel for ResponsesProvider {
    async fn generate(
        &self,
        messages: Vec<Message>,
        mut options: GenerateOptions,
    ) -> ProviderResult<BoxStream<'static, ProviderResult<StreamEvent>>> {
        let (system, converted) = Self::convert_messages(&messages);

        let request = ResponsesRequest {
            model: self.model.id.clone(),
            messages: converted,
            max_tokens: options.max_tokens.unwrap_or(self.model.max_output),
            system: options.system.clone().or(system),
            temperature: options.temperature,
            tools: Self::convert_tools(&options.tools),
            remote_tool_sources: Self::convert_remote_sources(&options.remote_tool_sources),
            stream: true,
        };

        debug!(
            model = %self.model.id,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            remote_sources = request.remote_tool_sources.len(),
            "Sending responses request"
        );

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Responses request failed");

            if status.as_u16() == 429 {
                return Err(ProviderError::RateLimited { retry_after: None });
            }

            return Err(ProviderError::api_error(status.as_u16(), body));
        }

        // Approval replies travel on a side channel back to the backend.
        if let Some(mut replies) = options.approval_replies.take() {
            let client = self.client.clone();
            let approvals_url = format!("{}/responses/approvals", self.base_url);
            let abort = options.abort.clone();
            tokio::spawn(async move {
                loop {
                    let reply = tokio::select! {
                        reply = replies.recv() => match reply {
                            Some(reply) => reply,
                            None => break,
                        },
                        _ = async {
                            match abort {
                                Some(ref token) => token.cancelled().await,
                                None => futures::future::pending().await,
                            }
                        } => break,
                    };

                    debug!(id = %reply.id, approve = reply.approve, "Sending approval reply");
                    let result = client
                        .post(&approvals_url)
                        .json(&json!({ "id": reply.id, "approve": reply.approve }))
                        .send()
                        .await;
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to deliver approval reply");
                    }
                }
            });
        }

        let abort = options.abort.clone();

        Ok(Box::pin(try_stream! {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut tool_args = std::collections::HashMap::new();

            while let Some(chunk) = stream.next().await {
                if let Some(ref token) = abort {
                    if token.is_cancelled() {
                        Err(ProviderError::Cancelled)?;
                    }
                }

                let chunk = chunk.map_err(ProviderError::RequestFailed)?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(event) = Self::extract_sse_event(&mut buffer) {
                    if let Some(parsed) = Self::parse_sse_event(&event, &mut tool_args)? {
                        yield parsed;
                    }
                }
            }
        }))
    }

    fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    fn backend_id(&self) -> &str {
        "responses"
    }
}
