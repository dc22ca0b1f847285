//! The conversation runtime: streaming, tool dispatch, permissions, compaction.

pub mod compaction;
pub mod dispatcher;
pub mod estimator;
pub mod events;
pub mod formatter;
pub mod hooks;
pub mod permissions;
pub mod prompt;
pub mod runner;

pub use compaction::{CompactionResult, CompactionStrategy, Compactor, SessionMemory};
pub use dispatcher::{
    SubAgentRequest, SubAgentRunner, ToolDispatcher, QUESTION_TOOL_NAME, SUBAGENT_TOOL_NAME,
};
pub use estimator::{estimate_context_usage, estimate_messages_tokens, ContextUsage};
pub use events::{CompactionPhase, CompactionTrigger, EventEmitter, EventPayload, SessionEvent};
pub use formatter::OutputFormatter;
pub use hooks::{HookVerdict, ToolCallInfo, ToolHooks};
pub use permissions::{
    PermissionBehavior, PermissionCache, PermissionCheck, PermissionDecision, PermissionReply,
    PermissionRequest,
};
pub use prompt::{PromptContext, StaticPrompt, SystemPromptBuilder};
pub use runner::{ConversationLoop, TurnContext, TurnOutcome};
