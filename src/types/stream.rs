//! Provider streaming event types.

use serde::{Deserialize, Serialize};

use super::message::StopReason;
use super::usage::Usage;

/// One event produced by a provider stream.
///
/// A stream is consumed until `Stop` or `Error`; tool-call arguments arrive
/// as JSON fragments that only parse once concatenated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking { text: String },
    Text { text: String },
    ToolUseStart { id: String, name: String },
    ToolUseDelta { id: String, partial_json: String },
    Stop { reason: StopReason },
    Usage { usage: Usage },
    Error { message: String },
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Thinking { text: text.into() }
    }

    pub fn tool_use_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ToolUseStart {
            id: id.into(),
            name: name.into(),
        }
    }

    pub fn tool_use_delta(id: impl Into<String>, partial_json: impl Into<String>) -> Self {
        Self::ToolUseDelta {
            id: id.into(),
            partial_json: partial_json.into(),
        }
    }

    pub fn stop(reason: StopReason) -> Self {
        Self::Stop { reason }
    }

    pub fn usage(input_tokens: u32, output_tokens: u32) -> Self {
        Self::Usage {
            usage: Usage::new(input_tokens, output_tokens),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
