//! Tool output formatting and history scrubbing.

use crate::config::OutputConfig;
use crate::types::{ContentBlock, Message};

pub const PERSISTED_OUTPUT_OPEN: &str = "<persisted-output>";
pub const PERSISTED_OUTPUT_CLOSE: &str = "</persisted-output>";
/// Replaces persisted-output blocks that fell out of the recent window.
pub const CLEARED_OUTPUT_PLACEHOLDER: &str = "[Old tool result content cleared]";

/// Converts raw tool output into the text stored in history.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFormatter {
    threshold_bytes: usize,
    preview_bytes: usize,
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self::from_config(&OutputConfig::default())
    }
}

impl OutputFormatter {
    pub fn new(threshold_bytes: usize, preview_bytes: usize) -> Self {
        Self {
            threshold_bytes,
            preview_bytes,
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.persist_threshold_bytes, config.preview_bytes)
    }

    /// Pass small output through; wrap large output in a persisted-output block.
    pub fn format(&self, content: &str) -> String {
        if content.len() < self.threshold_bytes {
            return content.to_string();
        }
        let preview = preview_slice(content, self.preview_bytes);
        let withheld = content.len() - preview.len();
        format!(
            "{PERSISTED_OUTPUT_OPEN}\nOutput too large ({total} bytes). Showing the first {shown} bytes.\n\n{preview}\n... [{withheld} more bytes withheld]\n{PERSISTED_OUTPUT_CLOSE}",
            total = content.len(),
            shown = preview.len(),
        )
    }
}

/// Cut `content` to at most `max_bytes`, backing up to the last newline when
/// that newline sits in the latter half of the window.
fn preview_slice(content: &str, max_bytes: usize) -> &str {
    let window = &content[..floor_char_boundary(content, max_bytes)];
    match window.rfind('\n') {
        Some(pos) if pos > window.len() / 2 => &window[..pos],
        _ => window,
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut idx = index;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Hard cap on raw tool output, applied before formatting.
pub fn truncate_raw_output(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }
    let cut = floor_char_boundary(&content, max_bytes);
    let dropped = content.len() - cut;
    let mut truncated = content;
    truncated.truncate(cut);
    truncated.push_str(&format!("\n[output truncated: {dropped} bytes dropped]"));
    truncated
}

pub fn is_persisted_output(content: &str) -> bool {
    content.starts_with(PERSISTED_OUTPUT_OPEN)
}

/// Replace all but the `keep_recent` newest persisted-output tool results
/// with [`CLEARED_OUTPUT_PLACEHOLDER`]. Returns how many were replaced.
pub fn scrub_persisted_outputs(messages: &mut [Message], keep_recent: usize) -> usize {
    let mut locations = Vec::new();
    for (message_idx, message) in messages.iter().enumerate() {
        for (block_idx, block) in message.content.iter().enumerate() {
            if let ContentBlock::ToolResult(result) = block {
                if is_persisted_output(&result.content) {
                    locations.push((message_idx, block_idx));
                }
            }
        }
    }

    let stale = locations.len().saturating_sub(keep_recent);
    for &(message_idx, block_idx) in &locations[..stale] {
        if let ContentBlock::ToolResult(result) = &mut messages[message_idx].content[block_idx] {
            result.content = CLEARED_OUTPUT_PLACEHOLDER.to_string();
        }
    }
    stale
}
