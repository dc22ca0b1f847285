//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    ConversationLoop, EventPayload, HookVerdict, PermissionCheck, PermissionReply, SessionEvent,
    ToolHooks, TurnContext, TurnOutcome,
};
pub use crate::config::RuntimeConfig;
pub use crate::error::{Result, RuntimeError};
pub use crate::provider::{ModelProvider, ScriptedCall, ScriptedProvider};
pub use crate::session::{
    ChannelTransport, SessionCoordinator, SessionOptions, SessionState, SessionStore, Transport,
};
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolOutput, ToolRegistry, ToolSchema};
pub use crate::types::{ContentBlock, Message, Role, StopReason, StreamEvent, Usage};
