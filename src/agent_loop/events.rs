//! Session event types delivered to the transport layer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::compaction::CompactionStrategy;
use super::permissions::PermissionRequest;
use crate::session::transport::Transport;
use crate::tools::StructuredData;
use crate::types::{StopReason, Usage};

/// Compaction progress marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompactionPhase {
    Start,
    End,
    Error,
}

/// What caused a compaction pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompactionTrigger {
    /// The heuristic estimate crossed the threshold.
    Estimate,
    /// The provider's last reported input tokens crossed the threshold.
    ReportedUsage,
    /// The provider rejected the prompt as too long.
    PromptTooLong,
}

/// Concrete event payloads emitted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ThinkingStart,
    ThinkingDelta {
        text: String,
    },
    ThinkingComplete {
        text: String,
    },
    TextDelta {
        text: String,
    },
    ToolUseStart {
        id: String,
        name: String,
    },
    ToolUseDelta {
        id: String,
        partial_json: String,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        success: bool,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured: Option<StructuredData>,
    },
    PermissionRequest {
        request: PermissionRequest,
    },
    Completion {
        stop_reason: StopReason,
        usage: Usage,
    },
    Error {
        message: String,
    },
    ContextCompaction {
        phase: CompactionPhase,
        trigger: CompactionTrigger,
        tokens_before: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_after: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        strategy: Option<CompactionStrategy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ContextUsage {
        used_tokens: usize,
        max_tokens: usize,
        percentage: u8,
        model: String,
    },
}

impl EventPayload {
    /// Whether delivering this event shows model output to a user.
    pub fn is_visible_output(&self) -> bool {
        matches!(
            self,
            Self::ThinkingStart
                | Self::ThinkingDelta { .. }
                | Self::TextDelta { .. }
                | Self::ToolUseStart { .. }
                | Self::ToolUseDelta { .. }
        )
    }
}

/// Envelope for session events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    pub session_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Sequenced event emitter bound to one session and an optional transport.
#[derive(Clone)]
pub struct EventEmitter {
    session_id: String,
    seq: Arc<AtomicU64>,
    transport: Option<Arc<dyn Transport>>,
}

impl EventEmitter {
    pub fn new(session_id: impl Into<String>, transport: Option<Arc<dyn Transport>>) -> Self {
        Self {
            session_id: session_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
            transport,
        }
    }

    /// Continue numbering from a counter that outlives this emitter.
    pub fn with_sequence(mut self, seq: Arc<AtomicU64>) -> Self {
        self.seq = seq;
        self
    }

    /// An emitter that drops every event.
    pub fn detached(session_id: impl Into<String>) -> Self {
        Self::new(session_id, None)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Send `payload`. Returns whether a transport received it.
    pub fn emit(&self, payload: EventPayload) -> bool {
        let Some(transport) = &self.transport else {
            return false;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        transport.send(SessionEvent {
            session_id: self.session_id.clone(),
            seq,
            timestamp: Utc::now(),
            payload,
        });
        true
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("session_id", &self.session_id)
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .field("transport", &self.transport.as_ref().map(|_| ".."))
            .finish()
    }
}
