//! Pre/post tool-use hooks.
//!
//! Hooks are observers with a veto: a pre-hook may reject a call, every
//! other hook outcome is advisory. A failing or panicking hook is logged
//! and skipped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;

use crate::error::RuntimeError;
use crate::tools::ToolResult;

type HookFuture<T> = Pin<Box<dyn Future<Output = Result<T, RuntimeError>> + Send>>;

/// Pre-hook verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Allow,
    Deny { message: Option<String> },
}

impl HookVerdict {
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: Some(message.into()),
        }
    }
}

/// The tool call a hook observes.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallInfo {
    pub session_id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
}

pub type PreToolUseHook = Arc<dyn Fn(ToolCallInfo) -> HookFuture<HookVerdict> + Send + Sync>;
pub type PostToolUseHook = Arc<dyn Fn(ToolCallInfo, ToolResult) -> HookFuture<()> + Send + Sync>;
pub type PostToolUseFailureHook = Arc<dyn Fn(ToolCallInfo, String) -> HookFuture<()> + Send + Sync>;

/// Registered hooks, run in registration order.
#[derive(Clone, Default)]
pub struct ToolHooks {
    pre: Vec<PreToolUseHook>,
    post: Vec<PostToolUseHook>,
    post_failure: Vec<PostToolUseFailureHook>,
}

impl ToolHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_tool_use(mut self, hook: PreToolUseHook) -> Self {
        self.pre.push(hook);
        self
    }

    pub fn with_post_tool_use(mut self, hook: PostToolUseHook) -> Self {
        self.post.push(hook);
        self
    }

    pub fn with_post_tool_use_failure(mut self, hook: PostToolUseFailureHook) -> Self {
        self.post_failure.push(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty() && self.post_failure.is_empty()
    }

    /// Run pre-hooks until one denies. Returns the denial message.
    pub async fn run_pre(&self, call: &ToolCallInfo) -> Option<String> {
        for hook in &self.pre {
            let verdict = guarded("pre_tool_use", &call.tool_name, || hook(call.clone())).await;
            if let Some(HookVerdict::Deny { message }) = verdict {
                return Some(message.unwrap_or_else(|| "denied by pre-tool-use hook".to_string()));
            }
        }
        None
    }

    pub async fn run_post(&self, call: &ToolCallInfo, result: &ToolResult) {
        for hook in &self.post {
            guarded("post_tool_use", &call.tool_name, || hook(call.clone(), result.clone())).await;
        }
    }

    pub async fn run_post_failure(&self, call: &ToolCallInfo, error: &str) {
        for hook in &self.post_failure {
            guarded("post_tool_use_failure", &call.tool_name, || {
                hook(call.clone(), error.to_string())
            })
            .await;
        }
    }
}

impl std::fmt::Debug for ToolHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHooks")
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .field("post_failure", &self.post_failure.len())
            .finish()
    }
}

/// Invoke one hook, turning errors and panics into `None`.
async fn guarded<T, F>(kind: &str, tool_name: &str, invoke: F) -> Option<T>
where
    F: FnOnce() -> HookFuture<T>,
{
    let future = match std::panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(future) => future,
        Err(_) => {
            tracing::warn!(hook = kind, tool = tool_name, "hook panicked; ignoring");
            return None;
        }
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            tracing::warn!(hook = kind, tool = tool_name, error = %err, "hook failed; ignoring");
            None
        }
        Err(_) => {
            tracing::warn!(hook = kind, tool = tool_name, "hook panicked; ignoring");
            None
        }
    }
}
