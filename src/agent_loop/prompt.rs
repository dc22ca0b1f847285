//! System prompt assembly.

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::provider::ToolDefinition;

/// What a prompt builder can see when assembling the system prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub session_id: &'a str,
    pub model: &'a str,
    pub tools: &'a [ToolDefinition],
    /// 0 for a top-level session, 1+ for sub-agents.
    pub depth: usize,
    /// Per-session addition to the base prompt.
    pub session_prompt: Option<&'a str>,
}

/// Builds the system prompt sent with every provider call of a turn.
#[async_trait]
pub trait SystemPromptBuilder: Send + Sync {
    async fn build(&self, ctx: &PromptContext<'_>) -> Result<String, RuntimeError>;
}

/// A fixed base prompt followed by the session's own addition.
#[derive(Debug, Clone, Default)]
pub struct StaticPrompt {
    base: String,
}

impl StaticPrompt {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }
}

#[async_trait]
impl SystemPromptBuilder for StaticPrompt {
    async fn build(&self, ctx: &PromptContext<'_>) -> Result<String, RuntimeError> {
        let mut prompt = self.base.clone();
        if ctx.depth > 0 {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(
                "You are a sub-agent. Complete the delegated task and reply with a concise final report.",
            );
        }
        if let Some(extra) = ctx.session_prompt.filter(|extra| !extra.trim().is_empty()) {
            if !prompt.is_empty() {
                prompt.push_str("\n\n");
            }
            prompt.push_str(extra);
        }
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_prompt_is_appended() {
        let builder = StaticPrompt::new("You are a coding assistant.");
        let prompt = builder
            .build(&PromptContext {
                session_id: "s1",
                model: "m",
                tools: &[],
                depth: 0,
                session_prompt: Some("Prefer small diffs."),
            })
            .await
            .expect("prompt");
        assert_eq!(prompt, "You are a coding assistant.\n\nPrefer small diffs.");
    }
}
