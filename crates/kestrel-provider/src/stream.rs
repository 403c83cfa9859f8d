//! Streaming event types.
//!
//! One conversation step is consumed as a lazy, finite, non-restartable
//! sequence of these events; cancellation closes the underlying stream.

use serde::{Deserialize, Serialize};

/// A typed event from a streaming chat response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text content is starting.
    ContentStart,
    /// Text content delta.
    ContentDelta(String),
    /// Text content ended.
    ContentEnd,

    /// Reasoning content is starting.
    ReasoningStart,
    /// Reasoning content delta.
    ReasoningDelta(String),
    /// Reasoning content ended.
    ReasoningEnd,

    /// A tool call is starting.
    ToolCallStart {
        /// Tool call ID.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Tool call arguments delta (streaming JSON).
    ToolCallDelta {
        /// Tool call ID.
        id: String,
        /// JSON fragment.
        delta: String,
    },
    /// Tool call completed; arguments are fully accumulated.
    ToolCallComplete {
        /// Tool call ID.
        id: String,
        /// Tool name.
        name: String,
        /// Complete arguments JSON.
        arguments: String,
    },

    /// A tool call the backend already executed server-side. Consumed
    /// as-is; the client must NOT execute it again.
    PreCalculatedToolResponse {
        /// Tool call ID.
        id: String,
        /// Tool name.
        name: String,
        /// Tool output.
        output: String,
        /// Whether the server-side execution failed.
        is_error: bool,
    },

    /// The backend asks for authorization before running a server-side
    /// tool. Answered on the stream, not executed locally.
    ApprovalRequest {
        /// Approval request ID.
        id: String,
        /// Tool name awaiting approval.
        tool_name: String,
    },

    /// The step finished.
    TurnComplete {
        /// Token usage for this step.
        usage: Usage,
        /// Reason for finishing.
        finish_reason: FinishReason,
    },

    /// An in-band error event.
    Error(String),
}

impl StreamEvent {
    /// Create a content delta event.
    pub fn content(delta: impl Into<String>) -> Self {
        Self::ContentDelta(delta.into())
    }

    /// Create a reasoning delta event.
    pub fn reasoning(delta: impl Into<String>) -> Self {
        Self::ReasoningDelta(delta.into())
    }

    /// Create a tool call start event.
    pub fn tool_call_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ToolCallStart {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Create a completed tool call event.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::ToolCallComplete {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Check if this is a content-related event.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            StreamEvent::ContentStart | StreamEvent::ContentDelta(_) | StreamEvent::ContentEnd
        )
    }

    /// Check if this is a reasoning-related event.
    pub fn is_reasoning(&self) -> bool {
        matches!(
            self,
            StreamEvent::ReasoningStart
                | StreamEvent::ReasoningDelta(_)
                | StreamEvent::ReasoningEnd
        )
    }

    /// Check if this is a tool-related event.
    pub fn is_tool(&self) -> bool {
        matches!(
            self,
            StreamEvent::ToolCallStart { .. }
                | StreamEvent::ToolCallDelta { .. }
                | StreamEvent::ToolCallComplete { .. }
                | StreamEvent::PreCalculatedToolResponse { .. }
        )
    }
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Input tokens used.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Reasoning tokens (for models with thinking).
    #[serde(default)]
    pub reasoning_tokens: u32,
}

impl Usage {
    /// Create a new usage with input and output tokens.
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Total tokens (input + output).
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Merge with another usage (adding all counts).
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

/// Reason for finishing a response step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal completion (end of turn).
    #[default]
    EndTurn,
    /// Stopped due to a stop sequence.
    Stop,
    /// Stopped due to max tokens.
    MaxTokens,
    /// Stopped for tool use.
    ToolUse,
    /// Content was filtered.
    ContentFilter,
    /// Unknown or other reason.
    Other,
}

impl FinishReason {
    /// Parse a chat-completions style finish_reason.
    pub fn from_completions(reason: &str) -> Self {
        match reason {
            "stop" => Self::EndTurn,
            "length" => Self::MaxTokens,
            "tool_calls" | "function_call" => Self::ToolUse,
            "content_filter" => Self::ContentFilter,
            _ => Self::Other,
        }
    }

    /// Parse a responses-protocol stop reason.
    pub fn from_responses(reason: &str) -> Self {
        match reason {
            "end_turn" => Self::EndTurn,
            "stop_sequence" => Self::Stop,
            "max_tokens" => Self::MaxTokens,
            "tool_use" => Self::ToolUse,
            _ => Self::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_merge() {
        let mut usage1 = Usage::new(100, 50);
        let usage2 = Usage::new(200, 100);

        usage1.merge(&usage2);

        assert_eq!(usage1.input_tokens, 300);
        assert_eq!(usage1.output_tokens, 150);
        assert_eq!(usage1.total(), 450);
    }

    #[test]
    fn test_finish_reason_parsing() {
        assert_eq!(
            FinishReason::from_responses("end_turn"),
            FinishReason::EndTurn
        );
        assert_eq!(
            FinishReason::from_responses("tool_use"),
            FinishReason::ToolUse
        );

        assert_eq!(FinishReason::from_completions("stop"), FinishReason::EndTurn);
        assert_eq!(
            FinishReason::from_completions("tool_calls"),
            FinishReason::ToolUse
        );
        assert_eq!(
            FinishReason::from_completions("weird"),
            FinishReason::Other
        );
    }

    #[test]
    fn test_event_classification() {
        assert!(StreamEvent::ContentStart.is_content());
        assert!(StreamEvent::content("hello").is_content());
        assert!(!StreamEvent::content("hello").is_reasoning());

        assert!(StreamEvent::reasoning("thinking").is_reasoning());

        assert!(StreamEvent::tool_call_start("id", "name").is_tool());
        assert!(StreamEvent::PreCalculatedToolResponse {
            id: "id".to_string(),
            name: "search".to_string(),
            output: "result".to_string(),
            is_error: false,
        }
        .is_tool());

        assert!(!StreamEvent::ApprovalRequest {
            id: "id".to_string(),
            tool_name: "search".to_string(),
        }
        .is_tool());
    }
}
