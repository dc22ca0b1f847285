//! Session state owned by one conversation.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_loop::permissions::PermissionCache;
use crate::tools::ToolFilter;
use crate::types::Message;

/// Everything the conversation loop reads and mutates for a session.
///
/// The permission cache and event counter are process-local and are not persisted.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionState {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Input tokens the provider reported for the most recent call.
    #[serde(default)]
    pub last_input_tokens: usize,
    #[serde(default)]
    pub tool_filter: ToolFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub permissions: PermissionCache,
    /// Last event sequence number sent for this session.
    #[serde(skip)]
    pub event_seq: Arc<AtomicU64>,
}

impl SessionState {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            model: model.into(),
            messages: Vec::new(),
            last_input_tokens: 0,
            tool_filter: ToolFilter::default(),
            system_prompt: None,
            created_at: now,
            updated_at: now,
            permissions: PermissionCache::new(),
            event_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tool_filter(mut self, filter: ToolFilter) -> Self {
        self.tool_filter = filter;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
