//! Context-window pruning.
//!
//! Before every model invocation the accumulated message list is trimmed
//! from the oldest end, in whole logical groups, until the estimated
//! token count fits the target fraction of the model's context window.
//! A group is a user message, or an assistant message together with all
//! tool results answering it; groups are never split and the most recent
//! group is never removed.

use kestrel_provider::{ContentPart, Message, Role};

/// Fraction of the context window the pruned history may occupy.
pub const CONTEXT_TARGET_FRACTION: f64 = 0.5;

/// Characters per token for estimation.
pub const CHARS_PER_TOKEN: usize = 4;

/// Flat token cost charged per embedded image.
pub const IMAGE_TOKEN_COST: usize = 765;

/// Estimate the token cost of one message.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut chars = 0usize;
    let mut images = 0usize;

    for part in &message.content {
        match part {
            ContentPart::Text { text } => chars += text.chars().count(),
            ContentPart::Thinking { text } => chars += text.chars().count(),
            ContentPart::ToolResult { content, .. } => chars += content.chars().count(),
            ContentPart::ToolUse { name, input, .. } => {
                chars += name.chars().count();
                chars += input.to_string().chars().count();
            }
            ContentPart::Image { .. } => images += 1,
        }
    }

    chars.div_ceil(CHARS_PER_TOKEN) + images * IMAGE_TOKEN_COST
}

/// Estimate the total token cost of a message list.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Split the message list into logical group boundaries.
///
/// Returns the start index of each group. Tool messages attach to the
/// group of the assistant message that issued their calls.
fn group_starts(messages: &[Message]) -> Vec<usize> {
    let mut starts = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        match message.role {
            Role::Tool => {
                // Attaches to the preceding group.
                if starts.is_empty() {
                    starts.push(i);
                }
            }
            _ => starts.push(i),
        }
    }
    starts
}

/// Trim whole groups from the oldest end until the estimate fits the
/// budget. The most recent group always survives.
pub fn prune_messages(messages: &mut Vec<Message>, context_window: u32) {
    let budget = (context_window as f64 * CONTEXT_TARGET_FRACTION) as usize;

    loop {
        if estimate_tokens(messages) <= budget {
            return;
        }

        let starts = group_starts(messages);
        if starts.len() <= 1 {
            // Only the most recent group is left; it is never removed.
            return;
        }

        // Drop the oldest group: everything before the second group start.
        let cut = starts[1];
        messages.drain(..cut);
        tracing::debug!(removed = cut, "Pruned oldest message group");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_with_calls(text: &str, call_ids: &[&str]) -> Message {
        let mut content = vec![ContentPart::text(text)];
        for id in call_ids {
            content.push(ContentPart::tool_use(
                *id,
                "search",
                serde_json::json!({"q": "x"}),
            ));
        }
        Message {
            role: Role::Assistant,
            content,
        }
    }

    #[test]
    fn test_estimate_text() {
        let msg = Message::user("abcd".repeat(10)); // 40 chars
        assert_eq!(estimate_message_tokens(&msg), 10);
    }

    #[test]
    fn test_estimate_rounds_up() {
        let msg = Message::user("abcde"); // 5 chars
        assert_eq!(estimate_message_tokens(&msg), 2);
    }

    #[test]
    fn test_estimate_images_flat_cost() {
        let msg = Message {
            role: Role::User,
            content: vec![ContentPart::Image {
                source: kestrel_provider::ImageSource::Url {
                    url: "https://example.com/x.png".to_string(),
                },
            }],
        };
        assert_eq!(estimate_message_tokens(&msg), IMAGE_TOKEN_COST);
    }

    #[test]
    fn test_group_starts_attach_tool_results() {
        let messages = vec![
            Message::user("q1"),                            // group 0
            assistant_with_calls("checking", &["call_1"]),  // group 1
            Message::tool_result("call_1", "result"),       // group 1
            Message::tool_result("call_1b", "result"),      // group 1
            Message::user("q2"),                            // group 2
            Message::assistant("answer"),                   // group 3
        ];

        assert_eq!(group_starts(&messages), vec![0, 1, 4, 5]);
    }

    #[test]
    fn test_prune_never_splits_call_result_pair() {
        let big = "x".repeat(4000); // ~1000 tokens per message
        let messages_template = vec![
            Message::user(big.clone()),
            assistant_with_calls(&big, &["call_1"]),
            Message::tool_result("call_1", big.clone()),
            Message::user(big.clone()),
        ];

        // Budget forces dropping until only the last group fits.
        let mut messages = messages_template;
        prune_messages(&mut messages, 4000); // budget = 2000 tokens

        // Whatever remains, no orphaned tool result may exist: every
        // tool_result id must have its tool_use in the remaining list.
        let call_ids: Vec<String> = messages
            .iter()
            .flat_map(|m| m.tool_call_ids())
            .map(String::from)
            .collect();
        for message in &messages {
            for result_id in message.tool_result_ids() {
                assert!(
                    call_ids.iter().any(|id| id == result_id),
                    "orphaned tool result {result_id}"
                );
            }
        }
    }

    #[test]
    fn test_prune_drops_oldest_first() {
        let big = "x".repeat(4000);
        let mut messages = vec![
            Message::user(format!("first {big}")),
            Message::assistant(big.clone()),
            Message::user(format!("last {big}")),
        ];

        prune_messages(&mut messages, 3000); // budget 1500 tokens, fits one group

        assert_eq!(messages.len(), 1);
        assert!(messages[0].text().starts_with("last"));
    }

    #[test]
    fn test_prune_never_removes_most_recent_group() {
        let huge = "x".repeat(100_000);
        let mut messages = vec![Message::user(huge)];

        // Budget far below the single group's size.
        prune_messages(&mut messages, 1000);

        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_prune_keeps_assistant_and_its_results_together() {
        let big = "x".repeat(4000);
        let mut messages = vec![
            Message::user(big.clone()),
            assistant_with_calls(&big, &["call_1", "call_2"]),
            Message::tool_result("call_1", big.clone()),
            Message::tool_result("call_2", big.clone()),
        ];

        // Budget fits the assistant group but not the user message too.
        prune_messages(&mut messages, 7000); // budget 3500 tokens

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[1].tool_result_ids(), vec!["call_1"]);
        assert_eq!(messages[2].tool_result_ids(), vec!["call_2"]);
    }

    #[test]
    fn test_no_prune_when_under_budget() {
        let mut messages = vec![Message::user("hi"), Message::assistant("hello")];
        let before = messages.len();

        prune_messages(&mut messages, 128_000);

        assert_eq!(messages.len(), before);
    }
}
