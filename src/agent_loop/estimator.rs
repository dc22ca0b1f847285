//! Heuristic token estimation.

use crate::types::{ContentBlock, Message};

pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut tokens = 4usize;
    for block in &message.content {
        tokens += match block {
            ContentBlock::Text { text } => estimate_text_tokens(text),
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                estimate_text_tokens(thinking)
                    + signature.as_deref().map_or(0, estimate_text_tokens)
            }
            ContentBlock::ToolUse(tool_use) => {
                let input = serde_json::to_string(&tool_use.input).unwrap_or_default();
                estimate_text_tokens(&tool_use.name) + estimate_text_tokens(&input) + 8
            }
            ContentBlock::ToolResult(result) => {
                estimate_text_tokens(&result.tool_use_id) + estimate_text_tokens(&result.content) + 8
            }
        };
    }
    tokens
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextUsage {
    pub used_tokens: usize,
    pub context_window: usize,
    pub remaining_tokens: usize,
    pub usage_percent: u8,
}

pub fn estimate_context_usage(messages: &[Message], context_window: usize) -> ContextUsage {
    let used_tokens = estimate_messages_tokens(messages);
    let remaining_tokens = context_window.saturating_sub(used_tokens);
    let usage_percent = if context_window == 0 {
        100
    } else {
        ((used_tokens.saturating_mul(100)) / context_window).min(100) as u8
    };

    ContextUsage {
        used_tokens,
        context_window,
        remaining_tokens,
        usage_percent,
    }
}
