//! The conversation loop: stream, dispatch tools, compact, retry.

mod assembler;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use bon::Builder;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

use self::assembler::{AssembledMessage, StreamAssembler};
use super::compaction::{Compactor, SessionMemory};
use super::dispatcher::{
    canceled_tool_result, DispatchContext, SubAgentRequest, SubAgentRunner, ToolDispatcher,
};
use super::estimator::estimate_context_usage;
use super::events::{CompactionPhase, CompactionTrigger, EventEmitter, EventPayload};
use super::formatter::{scrub_persisted_outputs, OutputFormatter};
use super::hooks::ToolHooks;
use super::prompt::{PromptContext, StaticPrompt, SystemPromptBuilder};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::models::ModelCatalog;
use crate::provider::{ModelProvider, ProviderRequest};
use crate::session::state::SessionState;
use crate::session::tracker::RuntimeStore;
use crate::session::transport::Transport;
use crate::tools::ToolRegistry;
use crate::types::{ContentBlock, Message, Role, StopReason, ToolUseBlock, Usage};
use crate::util::retry::{classify_error, ErrorClass, RetryDecision, RetryPolicy, RetryState};

/// Per-run inputs that are not part of the session.
#[derive(Clone, Default, Builder)]
pub struct TurnContext {
    #[builder(default)]
    pub cancel: CancellationToken,
    /// `None` for headless runs such as sub-agents.
    pub transport: Option<Arc<dyn Transport>>,
    /// Sub-agent nesting level.
    #[builder(default)]
    pub depth: usize,
}

impl std::fmt::Debug for TurnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnContext")
            .field("canceled", &self.cancel.is_cancelled())
            .field("has_transport", &self.transport.is_some())
            .field("depth", &self.depth)
            .finish()
    }
}

/// Result of one `run`.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Content of the final assistant message (partial text when canceled).
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    /// Summed over every provider call in the run.
    pub usage: Usage,
    /// Model responses received. Retried calls are not counted.
    pub iterations: usize,
}

impl TurnOutcome {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_canceled(&self) -> bool {
        self.stop_reason == StopReason::Canceled
    }
}

enum StreamAttempt {
    Completed(AssembledMessage),
    Canceled(Vec<ContentBlock>),
    Failed {
        error: RuntimeError,
        partial: Vec<ContentBlock>,
    },
}

enum CompactionOutcome {
    Compacted,
    Unchanged(String),
    Canceled,
}

struct DispatchBatch {
    results: Vec<ContentBlock>,
    extra_messages: Vec<Message>,
    canceled: bool,
}

/// Drives a session's turns against one provider.
///
/// Cheap to clone; sub-agents run on clones of their parent's loop.
#[derive(Clone)]
pub struct ConversationLoop {
    provider: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    hooks: ToolHooks,
    memory: Option<Arc<dyn SessionMemory>>,
    prompt: Arc<dyn SystemPromptBuilder>,
    store: Arc<RuntimeStore>,
    config: Arc<RuntimeConfig>,
    catalog: Arc<ModelCatalog>,
}

impl ConversationLoop {
    pub fn new(provider: Arc<dyn ModelProvider>, config: RuntimeConfig) -> Self {
        Self {
            provider,
            tools: ToolRegistry::new(),
            hooks: ToolHooks::new(),
            memory: None,
            prompt: Arc::new(StaticPrompt::default()),
            store: Arc::new(RuntimeStore::new()),
            catalog: Arc::new(config.model_catalog()),
            config: Arc::new(config),
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_hooks(mut self, hooks: ToolHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_session_memory(mut self, memory: Arc<dyn SessionMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_prompt_builder(mut self, prompt: Arc<dyn SystemPromptBuilder>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_store(mut self, store: Arc<RuntimeStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RuntimeStore> {
        &self.store
    }

    fn dispatcher(&self) -> ToolDispatcher {
        ToolDispatcher::new(
            self.tools.clone(),
            self.hooks.clone(),
            self.store.clone(),
            &self.config,
        )
    }

    fn compactor(&self) -> Compactor {
        Compactor::new(
            self.provider.clone(),
            self.memory.clone(),
            self.config.compaction.clone(),
        )
    }

    /// Run one user turn to completion.
    ///
    /// Appends the user input, then alternates provider calls and tool
    /// dispatch until the model stops asking for tools. History is left
    /// consistent on every exit path: each `tool_use` has its `tool_result`.
    pub async fn run(
        &self,
        session: &mut SessionState,
        ctx: TurnContext,
        input: impl Into<String>,
    ) -> Result<TurnOutcome, RuntimeError> {
        let emitter = EventEmitter::new(session.id.clone(), ctx.transport.clone())
            .with_sequence(session.event_seq.clone());
        let mut usage = Usage::default();
        let mut iterations = 0usize;

        if ctx.cancel.is_cancelled() {
            return Ok(canceled_outcome(&emitter, Vec::new(), usage, iterations));
        }

        session.messages.push(Message::user(input));
        session.touch();

        let dispatcher = self.dispatcher();
        let compactor = self.compactor();
        let formatter = OutputFormatter::from_config(&self.config.output);
        let policy = RetryPolicy::from_config(&self.config.retry);
        let definitions =
            dispatcher.definitions(&session.tool_filter, ctx.depth, emitter.has_transport());
        let system_prompt = self
            .prompt
            .build(&PromptContext {
                session_id: &session.id,
                model: &session.model,
                tools: &definitions,
                depth: ctx.depth,
                session_prompt: session.system_prompt.as_deref(),
            })
            .await?;

        let mut retry = RetryState::default();
        let mut force_compact = false;

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(canceled_outcome(&emitter, Vec::new(), usage, iterations));
            }

            let scrubbed = scrub_persisted_outputs(
                &mut session.messages,
                self.config.output.keep_recent_persisted,
            );
            if scrubbed > 0 {
                tracing::debug!(session_id = %session.id, scrubbed, "cleared stale persisted outputs");
            }

            let threshold = self
                .catalog
                .compaction_threshold(&session.model, self.config.compaction.fraction);
            let trigger = if force_compact {
                Some(CompactionTrigger::PromptTooLong)
            } else {
                compactor.needs_compaction(&session.messages, session.last_input_tokens, threshold)
            };
            if let Some(trigger) = trigger {
                force_compact = false;
                match self
                    .compact(&compactor, session, &emitter, trigger, threshold, &ctx.cancel)
                    .await
                {
                    CompactionOutcome::Compacted => {}
                    CompactionOutcome::Canceled => {
                        return Ok(canceled_outcome(&emitter, Vec::new(), usage, iterations));
                    }
                    CompactionOutcome::Unchanged(reason) => {
                        if trigger == CompactionTrigger::PromptTooLong {
                            let err = RuntimeError::CompactionFailed(reason);
                            emitter.emit(EventPayload::Error {
                                message: err.to_string(),
                            });
                            return Err(err);
                        }
                    }
                }
            }

            if iterations >= self.config.max_iterations {
                let err = RuntimeError::InvalidState(format!(
                    "conversation loop exceeded {} provider calls",
                    self.config.max_iterations
                ));
                emitter.emit(EventPayload::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }

            let context_window = self.catalog.context_window(&session.model);
            let context = estimate_context_usage(&session.messages, context_window);
            emitter.emit(EventPayload::ContextUsage {
                used_tokens: context.used_tokens,
                max_tokens: context.context_window,
                percentage: context.usage_percent,
                model: session.model.clone(),
            });
            tracing::debug!(
                session_id = %session.id,
                iteration = iterations + 1,
                tokens = context.used_tokens,
                "provider call"
            );

            let request = ProviderRequest {
                model: session.model.clone(),
                system_prompt: system_prompt.clone(),
                messages: session.messages.clone(),
                tools: definitions.clone(),
                max_tokens: None,
            };

            let message = match self
                .stream_once(&request, &emitter, &ctx.cancel, &mut retry)
                .await
            {
                StreamAttempt::Completed(message) => message,
                StreamAttempt::Canceled(partial) => {
                    preserve_partial(session, partial.clone());
                    return Ok(canceled_outcome(&emitter, partial, usage, iterations));
                }
                StreamAttempt::Failed { error, partial } => {
                    match retry.on_error(&policy, &error) {
                        RetryDecision::Backoff { attempt, delay } => {
                            tracing::warn!(
                                session_id = %session.id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "transient provider error; retrying"
                            );
                            tokio::select! {
                                _ = ctx.cancel.cancelled() => {
                                    return Ok(canceled_outcome(&emitter, Vec::new(), usage, iterations));
                                }
                                _ = time::sleep(delay) => {}
                            }
                            continue;
                        }
                        RetryDecision::ForceCompact => {
                            tracing::warn!(
                                session_id = %session.id,
                                error = %error,
                                "prompt too long; forcing compaction"
                            );
                            force_compact = true;
                            continue;
                        }
                        RetryDecision::Surface => {
                            let error = match error {
                                RuntimeError::PromptTooLarge(message) => {
                                    RuntimeError::PromptTooLarge(message)
                                }
                                other
                                    if retry.force_compacted
                                        && classify_error(&other) == ErrorClass::PromptTooLong =>
                                {
                                    RuntimeError::PromptTooLarge(other.to_string())
                                }
                                other => other,
                            };
                            preserve_partial(session, partial);
                            emitter.emit(EventPayload::Error {
                                message: error.to_string(),
                            });
                            return Err(error);
                        }
                    }
                }
            };

            retry.on_success();
            iterations += 1;
            if let Some(call_usage) = &message.usage {
                usage.merge(call_usage);
                session.last_input_tokens = call_usage.input_tokens as usize;
            }

            let tool_uses = message.tool_uses();
            if tool_uses.is_empty() {
                if !message.content.is_empty() {
                    session
                        .messages
                        .push(Message::new(Role::Assistant, message.content.clone()));
                }
                session.touch();
                emitter.emit(EventPayload::Completion {
                    stop_reason: message.stop_reason,
                    usage: usage.clone(),
                });
                return Ok(TurnOutcome {
                    content: message.content,
                    stop_reason: message.stop_reason,
                    usage,
                    iterations,
                });
            }

            let history_len = session.messages.len();
            session
                .messages
                .push(Message::new(Role::Assistant, message.content.clone()));
            let batch = self
                .dispatch_tools(
                    &dispatcher,
                    &formatter,
                    session,
                    history_len,
                    &tool_uses,
                    &emitter,
                    &ctx,
                )
                .await;
            session.messages.push(Message::tool_results(batch.results));
            session.messages.extend(batch.extra_messages);
            session.touch();

            if batch.canceled {
                return Ok(canceled_outcome(&emitter, message.content, usage, iterations));
            }
        }
    }

    async fn stream_once(
        &self,
        request: &ProviderRequest,
        emitter: &EventEmitter,
        cancel: &CancellationToken,
        retry: &mut RetryState,
    ) -> StreamAttempt {
        let opened = tokio::select! {
            _ = cancel.cancelled() => return StreamAttempt::Canceled(Vec::new()),
            opened = self.provider.stream(request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                return StreamAttempt::Failed {
                    error,
                    partial: Vec::new(),
                }
            }
        };

        let mut assembler = StreamAssembler::new();
        let idle_timeout_ms = self.config.stream_idle_timeout_ms;
        let idle_enabled = idle_timeout_ms > 0;
        let idle = Duration::from_millis(idle_timeout_ms);
        let idle_sleep = time::sleep(idle);
        tokio::pin!(idle_sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StreamAttempt::Canceled(assembler.into_partial());
                }
                _ = &mut idle_sleep, if idle_enabled => {
                    if assembler.is_stopped() {
                        break;
                    }
                    return StreamAttempt::Failed {
                        error: RuntimeError::Timeout(idle_timeout_ms),
                        partial: assembler.into_partial(),
                    };
                }
                event = stream.next() => {
                    let Some(event) = event else { break; };
                    if idle_enabled {
                        idle_sleep.as_mut().reset(Instant::now() + idle);
                    }
                    let payloads = match event.and_then(|event| assembler.apply(event)) {
                        Ok(payloads) => payloads,
                        Err(error) if assembler.is_stopped() => {
                            tracing::debug!(error = %error, "stream failed after stop; keeping the response");
                            break;
                        }
                        Err(error) => {
                            return StreamAttempt::Failed {
                                error,
                                partial: assembler.into_partial(),
                            };
                        }
                    };
                    for payload in payloads {
                        let visible = payload.is_visible_output();
                        if emitter.emit(payload) && visible {
                            retry.has_streamed = true;
                        }
                    }
                }
            }
        }

        let (message, trailing) = assembler.finish();
        for payload in trailing {
            emitter.emit(payload);
        }
        StreamAttempt::Completed(message)
    }

    async fn compact(
        &self,
        compactor: &Compactor,
        session: &mut SessionState,
        emitter: &EventEmitter,
        trigger: CompactionTrigger,
        threshold: usize,
        cancel: &CancellationToken,
    ) -> CompactionOutcome {
        let tokens_before = super::estimator::estimate_messages_tokens(&session.messages);
        tracing::debug!(
            session_id = %session.id,
            %trigger,
            tokens = tokens_before,
            threshold,
            "compacting context"
        );
        emitter.emit(EventPayload::ContextCompaction {
            phase: CompactionPhase::Start,
            trigger,
            tokens_before,
            tokens_after: None,
            strategy: None,
            error: None,
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => return CompactionOutcome::Canceled,
            result = compactor.compact(&session.id, &session.model, &session.messages, threshold) => result,
        };

        if !result.was_compacted {
            let reason = result
                .failure
                .unwrap_or_else(|| "compaction made no progress".to_string());
            emitter.emit(EventPayload::ContextCompaction {
                phase: CompactionPhase::Error,
                trigger,
                tokens_before,
                tokens_after: None,
                strategy: None,
                error: Some(reason.clone()),
            });
            return CompactionOutcome::Unchanged(reason);
        }

        tracing::info!(
            session_id = %session.id,
            strategy = ?result.strategy,
            tokens_before = result.tokens_before,
            tokens_after = result.tokens_after,
            "context compacted"
        );
        emitter.emit(EventPayload::ContextCompaction {
            phase: CompactionPhase::End,
            trigger,
            tokens_before,
            tokens_after: Some(result.tokens_after),
            strategy: result.strategy,
            error: None,
        });
        session.messages = result.messages;
        session.last_input_tokens = 0;
        CompactionOutcome::Compacted
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tools(
        &self,
        dispatcher: &ToolDispatcher,
        formatter: &OutputFormatter,
        session: &SessionState,
        history_len: usize,
        tool_uses: &[ToolUseBlock],
        emitter: &EventEmitter,
        ctx: &TurnContext,
    ) -> DispatchBatch {
        let dispatch_ctx = DispatchContext {
            session_id: &session.id,
            model: &session.model,
            filter: &session.tool_filter,
            permissions: &session.permissions,
            emitter,
            cancel: &ctx.cancel,
            history: &session.messages[..history_len],
            depth: ctx.depth,
            subagents: Some(self as &dyn SubAgentRunner),
        };

        let mut batch = DispatchBatch {
            results: Vec::with_capacity(tool_uses.len()),
            extra_messages: Vec::new(),
            canceled: false,
        };
        for call in tool_uses {
            if ctx.cancel.is_cancelled() {
                batch.canceled = true;
                batch
                    .results
                    .push(canceled_tool_result().to_content_block(&call.id));
                continue;
            }

            let result = dispatcher.execute_tool(call, &dispatch_ctx).await;
            let content = formatter.format(&result.content);
            emitter.emit(EventPayload::ToolResult {
                tool_use_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: result.success,
                content: content.clone(),
                structured: result.structured.clone(),
            });
            batch
                .results
                .push(ContentBlock::tool_result(&call.id, content, result.is_error()));
            batch.extra_messages.extend(result.extra_messages);
        }
        batch.canceled |= ctx.cancel.is_cancelled();
        batch
    }
}

impl SubAgentRunner for ConversationLoop {
    fn spawn_subagent(
        &self,
        request: SubAgentRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<TurnOutcome, RuntimeError>> {
        let runner = self.clone();
        tokio::spawn(async move {
            let id = format!(
                "{}/{}",
                request.parent_session_id,
                runner.store.next_id("subagent")
            );
            tracing::debug!(session_id = %id, depth = request.depth, description = %request.description, "sub-agent start");
            let mut state = SessionState::new(id, request.model)
                .with_messages(request.seed_messages)
                .with_tool_filter(request.tool_filter);
            let ctx = TurnContext {
                cancel,
                transport: None,
                depth: request.depth,
            };
            runner.run(&mut state, ctx, request.prompt).await
        })
    }
}

impl std::fmt::Debug for ConversationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLoop")
            .field("provider", &self.provider.provider_name())
            .field("tools", &self.tools)
            .field("hooks", &self.hooks)
            .field("has_memory", &self.memory.is_some())
            .finish()
    }
}

fn preserve_partial(session: &mut SessionState, partial: Vec<ContentBlock>) {
    if !partial.is_empty() {
        session.messages.push(Message::new(Role::Assistant, partial));
        session.touch();
    }
}

fn canceled_outcome(
    emitter: &EventEmitter,
    content: Vec<ContentBlock>,
    usage: Usage,
    iterations: usize,
) -> TurnOutcome {
    emitter.emit(EventPayload::Completion {
        stop_reason: StopReason::Canceled,
        usage: usage.clone(),
    });
    TurnOutcome {
        content,
        stop_reason: StopReason::Canceled,
        usage,
        iterations,
    }
}
