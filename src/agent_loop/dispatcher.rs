//! Tool call dispatch: resolve, authorize, hook, execute, normalize.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::EventEmitter;
use super::formatter::truncate_raw_output;
use super::hooks::{ToolCallInfo, ToolHooks};
use super::permissions::{PermissionCache, PermissionGate};
use super::runner::TurnOutcome;
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::provider::ToolDefinition;
use crate::session::tracker::RuntimeStore;
use crate::session::transport::QuestionRequest;
use crate::tools::{
    StructuredData, ToolArguments, ToolContext, ToolFilter, ToolOutput, ToolRegistry, ToolResult,
    ToolSchema,
};
use crate::types::{Message, ToolUseBlock};
use crate::util::timeout::with_timeout;

pub const SUBAGENT_TOOL_NAME: &str = "task";
pub const QUESTION_TOOL_NAME: &str = "ask_user_question";

/// A nested conversation requested through the `task` tool.
#[derive(Debug, Clone)]
pub struct SubAgentRequest {
    pub parent_session_id: String,
    pub model: String,
    pub description: String,
    pub prompt: String,
    /// History the child starts from. Empty unless the parent forked its context.
    pub seed_messages: Vec<Message>,
    pub tool_filter: ToolFilter,
    pub depth: usize,
}

/// Starts nested conversation loops as supervised tasks.
pub trait SubAgentRunner: Send + Sync {
    fn spawn_subagent(
        &self,
        request: SubAgentRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<TurnOutcome, RuntimeError>>;
}

/// Per-call view of the session state the dispatcher needs.
pub struct DispatchContext<'a> {
    pub session_id: &'a str,
    pub model: &'a str,
    pub filter: &'a ToolFilter,
    pub permissions: &'a PermissionCache,
    pub emitter: &'a EventEmitter,
    pub cancel: &'a CancellationToken,
    /// History before the assistant message whose tool calls are running.
    pub history: &'a [Message],
    pub depth: usize,
    pub subagents: Option<&'a dyn SubAgentRunner>,
}

#[derive(Debug, Deserialize)]
struct SubAgentInput {
    description: String,
    prompt: String,
    #[serde(default)]
    fork_context: bool,
}

#[derive(Debug, Deserialize)]
struct QuestionInput {
    question: String,
    #[serde(default)]
    options: Vec<String>,
}

enum Resolved {
    Registered(Arc<dyn crate::tools::Tool>),
    SubAgent,
    Question,
}

/// Routes tool calls through the permission gate, hooks and executors.
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    registry: ToolRegistry,
    hooks: ToolHooks,
    gate: PermissionGate,
    store: Arc<RuntimeStore>,
    max_raw_output_bytes: usize,
    question_timeout: Duration,
    subagents_enabled: bool,
    max_depth: usize,
}

impl ToolDispatcher {
    pub fn new(
        registry: ToolRegistry,
        hooks: ToolHooks,
        store: Arc<RuntimeStore>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            hooks,
            gate: PermissionGate::new(config.permissions.request_timeout()),
            store,
            max_raw_output_bytes: config.output.max_raw_output_bytes,
            question_timeout: Duration::from_secs(config.questions.timeout_secs),
            subagents_enabled: config.subagents.enabled,
            max_depth: config.subagents.max_depth,
        }
    }

    fn subagents_available(&self, depth: usize) -> bool {
        self.subagents_enabled && depth < self.max_depth
    }

    /// Tool definitions offered to the model for one turn.
    pub fn definitions(
        &self,
        filter: &ToolFilter,
        depth: usize,
        interactive: bool,
    ) -> Vec<ToolDefinition> {
        let mut definitions = self.registry.definitions(filter);
        if self.subagents_available(depth) && filter.permits(SUBAGENT_TOOL_NAME) {
            definitions.push(subagent_definition());
        }
        if interactive && filter.permits(QUESTION_TOOL_NAME) {
            definitions.push(question_definition());
        }
        definitions
    }

    /// Run one tool call to a normalized result. Never fails; every problem
    /// becomes a failed [`ToolResult`].
    pub async fn execute_tool(&self, call: &ToolUseBlock, ctx: &DispatchContext<'_>) -> ToolResult {
        let resolved = match call.name.as_str() {
            SUBAGENT_TOOL_NAME => Resolved::SubAgent,
            QUESTION_TOOL_NAME => Resolved::Question,
            name => match self.registry.get(name) {
                Some(tool) => Resolved::Registered(tool.clone()),
                None => {
                    return ToolResult::failure(RuntimeError::UnknownTool(name.to_string()).to_string())
                }
            },
        };

        if !ctx.filter.permits(&call.name) {
            return ToolResult::failure(RuntimeError::ToolDisabled(call.name.clone()).to_string());
        }

        let tool_ctx = ToolContext {
            session_id: ctx.session_id.to_string(),
            tool_use_id: call.id.clone(),
            cancel: ctx.cancel.child_token(),
            store: self.store.clone(),
        };
        let mut input = ToolArguments::new(call.input.clone());

        if let Resolved::Registered(tool) = &resolved {
            match self
                .gate
                .authorize(tool.as_ref(), input, &tool_ctx, ctx.permissions, ctx.emitter)
                .await
            {
                Ok(authorized) => input = authorized,
                Err(RuntimeError::Canceled) => return canceled_tool_result(),
                Err(err) => {
                    tracing::debug!(tool = %call.name, error = %err, "tool call not authorized");
                    return ToolResult::failure(err.to_string());
                }
            }
        }

        let info = ToolCallInfo {
            session_id: ctx.session_id.to_string(),
            tool_use_id: call.id.clone(),
            tool_name: call.name.clone(),
            input: input.raw().clone(),
        };
        if let Some(message) = self.hooks.run_pre(&info).await {
            return ToolResult::failure(RuntimeError::HookRejected { message }.to_string());
        }

        let outcome = match resolved {
            Resolved::Registered(tool) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(RuntimeError::Canceled),
                    result = tool.execute(&input, &tool_ctx) => result,
                }
            }
            Resolved::SubAgent => self.run_subagent(&input, ctx).await,
            Resolved::Question => self.ask_question(call, &input, ctx).await,
        };

        let result = match outcome {
            Ok(output) => {
                let mut result = ToolResult::success(output);
                result.content = truncate_raw_output(result.content, self.max_raw_output_bytes);
                self.hooks.run_post(&info, &result).await;
                result
            }
            Err(RuntimeError::Canceled) => canceled_tool_result(),
            Err(err) => {
                let message = match err {
                    RuntimeError::ToolExecution { .. } => err.to_string(),
                    other => RuntimeError::ToolExecution {
                        tool_name: call.name.clone(),
                        message: other.to_string(),
                    }
                    .to_string(),
                };
                self.hooks.run_post_failure(&info, &message).await;
                ToolResult::failure(message)
            }
        };

        tracing::debug!(
            session_id = %ctx.session_id,
            tool = %call.name,
            success = result.success,
            bytes = result.content.len(),
            "tool dispatched"
        );
        result
    }

    async fn run_subagent(
        &self,
        input: &ToolArguments,
        ctx: &DispatchContext<'_>,
    ) -> Result<ToolOutput, RuntimeError> {
        let Some(runner) = ctx.subagents.filter(|_| self.subagents_available(ctx.depth)) else {
            return Err(RuntimeError::InvalidState(format!(
                "sub-agents unavailable at depth {}",
                ctx.depth
            )));
        };
        let request: SubAgentInput = input.deserialize()?;
        let seed_messages = if request.fork_context {
            ctx.history.to_vec()
        } else {
            Vec::new()
        };

        let child_cancel = ctx.cancel.child_token();
        let handle = runner.spawn_subagent(
            SubAgentRequest {
                parent_session_id: ctx.session_id.to_string(),
                model: ctx.model.to_string(),
                description: request.description.clone(),
                prompt: request.prompt,
                seed_messages,
                tool_filter: ctx.filter.clone(),
                depth: ctx.depth + 1,
            },
            child_cancel,
        );

        // Cancel reaches the child through its derived token, so awaiting the
        // handle also covers the canceled case.
        let outcome = handle
            .await
            .map_err(|err| RuntimeError::InvalidState(format!("sub-agent task failed: {err}")))??;

        if ctx.cancel.is_cancelled() {
            return Err(RuntimeError::Canceled);
        }
        let text = outcome.text();
        Ok(ToolOutput::text(text).with_structured(StructuredData::SubAgent {
            description: request.description,
            stop_reason: outcome.stop_reason,
            usage: outcome.usage,
        }))
    }

    async fn ask_question(
        &self,
        call: &ToolUseBlock,
        input: &ToolArguments,
        ctx: &DispatchContext<'_>,
    ) -> Result<ToolOutput, RuntimeError> {
        let Some(transport) = ctx.emitter.transport() else {
            return Err(RuntimeError::InvalidState(
                "no interactive transport attached".to_string(),
            ));
        };
        let request: QuestionInput = input.deserialize()?;
        let question = QuestionRequest {
            id: self.store.next_id("question"),
            tool_use_id: call.id.clone(),
            question: request.question.clone(),
            options: request.options,
        };

        let answer = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(RuntimeError::Canceled),
            answer = with_timeout(self.question_timeout, transport.ask_question(question)) => answer,
        };
        let answer = match answer {
            Err(RuntimeError::Timeout(_)) => {
                return Err(RuntimeError::InvalidState(format!(
                    "question timed out after {}s",
                    self.question_timeout.as_secs()
                )))
            }
            other => other?,
        };

        Ok(ToolOutput::text(answer.clone()).with_structured(StructuredData::Question {
            question: request.question,
            answer,
        }))
    }
}

/// Result recorded for a tool call that was canceled before it finished.
pub fn canceled_tool_result() -> ToolResult {
    ToolResult::failure("canceled")
}

fn subagent_definition() -> ToolDefinition {
    let schema = ToolSchema::object()
        .string("description", "Short label for the delegated task", true)
        .string("prompt", "Full instructions for the sub-agent", true)
        .boolean(
            "fork_context",
            "Start the sub-agent from a copy of this conversation",
            false,
        )
        .build();
    ToolDefinition {
        name: SUBAGENT_TOOL_NAME.to_string(),
        description: "Delegate a self-contained task to a sub-agent and return its final answer."
            .to_string(),
        input_schema: schema.schema,
    }
}

fn question_definition() -> ToolDefinition {
    let schema = ToolSchema::object()
        .string("question", "Question to show the user", true)
        .build();
    let mut input_schema = schema.schema;
    input_schema["properties"]["options"] = serde_json::json!({
        "type": "array",
        "items": { "type": "string" },
        "description": "Suggested answers",
    });
    ToolDefinition {
        name: QUESTION_TOOL_NAME.to_string(),
        description: "Ask the user a question and wait for the answer.".to_string(),
        input_schema,
    }
}
