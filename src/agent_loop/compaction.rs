//! Context compaction: replace history with a condensed summary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::estimator::{estimate_message_tokens, estimate_messages_tokens};
use super::events::CompactionTrigger;
use crate::config::CompactionConfig;
use crate::provider::{ModelProvider, ProviderRequest};
use crate::types::{ContentBlock, Message, Role};

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a context summarization assistant. Summarize conversation history for another coding assistant.";
const SUMMARY_INSTRUCTIONS: &str = "Summarize the conversation above so another model can continue the work. Use exactly these sections:

## User requests
Every explicit request the user made, in the order they were made.

## Actions taken
Files read, created or modified, commands run and tools used.

## Key decisions
Technical and architectural decisions, with the reason for each.

## Current state
What is finished and what work is still open.

## Errors and resolutions
Errors encountered and how each one was resolved, or that it is still unresolved.

Preserve exact file paths, commands and error messages. Be concise.";
const SUMMARY_PREAMBLE: &str = "This session is being continued from a previous conversation that ran out of context. The conversation is summarized below:";
const SESSION_MEMORY_PREAMBLE: &str = "Earlier context of this session has been condensed into the session memory below:";

/// Which strategy produced a compacted history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompactionStrategy {
    /// An externally maintained running summary of the session.
    SessionMemory,
    /// A one-off summary produced by the model.
    ModelSummary,
}

/// Source of an incrementally maintained session summary.
#[async_trait]
pub trait SessionMemory: Send + Sync {
    async fn current_summary(&self, session_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub was_compacted: bool,
    /// The replacement history, or the input unchanged.
    pub messages: Vec<Message>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub strategy: Option<CompactionStrategy>,
    /// Why no strategy applied, when `was_compacted` is false.
    pub failure: Option<String>,
}

impl CompactionResult {
    pub fn tokens_saved(&self) -> usize {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    fn unchanged(messages: &[Message], tokens_before: usize, failure: String) -> Self {
        Self {
            was_compacted: false,
            messages: messages.to_vec(),
            tokens_before,
            tokens_after: tokens_before,
            strategy: None,
            failure: Some(failure),
        }
    }
}

/// Runs the two-strategy compaction pipeline.
#[derive(Clone)]
pub struct Compactor {
    provider: Arc<dyn ModelProvider>,
    memory: Option<Arc<dyn SessionMemory>>,
    config: CompactionConfig,
}

impl Compactor {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        memory: Option<Arc<dyn SessionMemory>>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            provider,
            memory,
            config,
        }
    }

    /// Whether the history should be compacted before the next provider call.
    pub fn needs_compaction(
        &self,
        messages: &[Message],
        last_input_tokens: usize,
        threshold: usize,
    ) -> Option<CompactionTrigger> {
        if !self.config.enabled || messages.is_empty() {
            return None;
        }
        if estimate_messages_tokens(messages) >= threshold {
            Some(CompactionTrigger::Estimate)
        } else if last_input_tokens >= threshold {
            Some(CompactionTrigger::ReportedUsage)
        } else {
            None
        }
    }

    /// Try session memory, then a model summary. Never fails: when neither
    /// strategy helps, the input comes back unchanged with the reason.
    pub async fn compact(
        &self,
        session_id: &str,
        model: &str,
        messages: &[Message],
        threshold: usize,
    ) -> CompactionResult {
        let tokens_before = estimate_messages_tokens(messages);
        let mut reasons = Vec::new();

        match self.session_memory_message(session_id, threshold).await {
            Ok(message) => {
                if let Some(result) =
                    shrunk(message, tokens_before, CompactionStrategy::SessionMemory)
                {
                    return result;
                }
                reasons.push("session memory not smaller than history".to_string());
            }
            Err(reason) => reasons.push(reason),
        }

        match self.model_summary_message(model, messages, threshold).await {
            Ok(message) => {
                if let Some(result) = shrunk(message, tokens_before, CompactionStrategy::ModelSummary)
                {
                    return result;
                }
                reasons.push("model summary not smaller than history".to_string());
            }
            Err(reason) => reasons.push(reason),
        }

        let failure = reasons.join("; ");
        tracing::warn!(session_id, tokens_before, reason = %failure, "compaction fell through");
        CompactionResult::unchanged(messages, tokens_before, failure)
    }

    async fn session_memory_message(
        &self,
        session_id: &str,
        threshold: usize,
    ) -> Result<Message, String> {
        let Some(memory) = &self.memory else {
            return Err("no session memory".to_string());
        };
        let summary = memory
            .current_summary(session_id)
            .await
            .filter(|summary| !summary.trim().is_empty())
            .ok_or_else(|| "session memory empty".to_string())?;

        let message = continuation_message(SESSION_MEMORY_PREAMBLE, &summary);
        let budget = (threshold as f64 * self.config.session_memory_max_fraction) as usize;
        let tokens = estimate_message_tokens(&message);
        if tokens >= budget {
            return Err(format!(
                "session memory too large ({tokens} tokens, budget {budget})"
            ));
        }
        Ok(message)
    }

    async fn model_summary_message(
        &self,
        model: &str,
        messages: &[Message],
        threshold: usize,
    ) -> Result<Message, String> {
        let start = messages.len().saturating_sub(self.config.summary_message_count);
        let selected = select_messages_with_token_budget_newest_first(&messages[start..], threshold);
        if selected.is_empty() {
            return Err("no messages fit the summarization budget".to_string());
        }

        let conversation = serialize_messages_for_summary(&selected);
        let prompt = format!(
            "<conversation>\n{conversation}\n</conversation>\n\n{SUMMARY_INSTRUCTIONS}"
        );
        let request = ProviderRequest {
            model: model.to_string(),
            system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            max_tokens: Some(self.config.summary_max_tokens),
        };

        let summary = self
            .provider
            .complete(&request)
            .await
            .map_err(|err| format!("summarization failed: {err}"))?;
        if summary.trim().is_empty() {
            return Err("summarization returned no text".to_string());
        }
        Ok(continuation_message(SUMMARY_PREAMBLE, summary.trim()))
    }
}

impl std::fmt::Debug for Compactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compactor")
            .field("provider", &self.provider.provider_name())
            .field("has_memory", &self.memory.is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn shrunk(
    message: Message,
    tokens_before: usize,
    strategy: CompactionStrategy,
) -> Option<CompactionResult> {
    let tokens_after = estimate_message_tokens(&message);
    (tokens_after < tokens_before).then(|| CompactionResult {
        was_compacted: true,
        messages: vec![message],
        tokens_before,
        tokens_after,
        strategy: Some(strategy),
        failure: None,
    })
}

fn continuation_message(preamble: &str, summary: &str) -> Message {
    Message::new(
        Role::User,
        vec![ContentBlock::text(format!(
            "{preamble}\n\n<summary>\n{summary}\n</summary>"
        ))],
    )
}

/// Newest messages whose estimates fit `token_budget`, in original order.
pub fn select_messages_with_token_budget_newest_first(
    messages: &[Message],
    token_budget: usize,
) -> Vec<Message> {
    if token_budget == 0 || messages.is_empty() {
        return Vec::new();
    }

    let mut selected = Vec::new();
    let mut used_tokens = 0usize;
    for message in messages.iter().rev() {
        let message_tokens = estimate_message_tokens(message);
        if used_tokens + message_tokens > token_budget {
            break;
        }
        used_tokens += message_tokens;
        selected.push(message.clone());
    }

    selected.reverse();
    selected
}

/// Flatten messages into a line-per-block transcript for the summarizer.
pub fn serialize_messages_for_summary(messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for message in messages {
        for block in &message.content {
            match (message.role, block) {
                (role, ContentBlock::Text { text }) => lines.push(format!("[{role}] {text}")),
                (_, ContentBlock::ToolUse(call)) => {
                    let args =
                        serde_json::to_string(&call.input).unwrap_or_else(|_| "{}".to_string());
                    lines.push(format!("[assistant.tool_call] {} {}", call.name, args));
                }
                (_, ContentBlock::ToolResult(result)) => lines.push(format!(
                    "[tool] id={} is_error={} result={}",
                    result.tool_use_id, result.is_error, result.content
                )),
                (_, ContentBlock::Thinking { .. }) => lines.push("[thinking] <omitted>".to_string()),
            }
        }
    }
    lines.join("\n")
}
