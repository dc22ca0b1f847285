//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::types::{ToolOutput, ToolSchema};
use crate::agent_loop::permissions::PermissionCheck;
use crate::error::RuntimeError;
use crate::session::tracker::RuntimeStore;

/// Context available during permission checks and tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub tool_use_id: String,
    /// Canceled when the owning turn is canceled.
    pub cancel: CancellationToken,
    pub store: Arc<RuntimeStore>,
}

/// Core tool trait. Implement to expose a capability to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the input.
    fn input_schema(&self) -> &ToolSchema;

    /// Tool-specific permission check. The default allows every call.
    async fn check_permissions(&self, _input: &ToolArguments, _ctx: &ToolContext) -> PermissionCheck {
        PermissionCheck::allow()
    }

    /// Execute the tool. Errors are reported to the model as a failed result.
    async fn execute(
        &self,
        input: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, RuntimeError>;
}

type ToolHandler = dyn Fn(
        ToolArguments,
        ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, RuntimeError>> + Send>>
    + Send
    + Sync;

type PermissionHandler = dyn Fn(&ToolArguments) -> PermissionCheck + Send + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    schema: ToolSchema,
    handler: Arc<ToolHandler>,
    permission: Option<Arc<PermissionHandler>>,
}

impl AgentTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: ToolSchema,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, RuntimeError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
            permission: None,
        }
    }

    /// Attach a synchronous permission check.
    pub fn with_permission_check<P>(mut self, check: P) -> Self
    where
        P: Fn(&ToolArguments) -> PermissionCheck + Send + Sync + 'static,
    {
        self.permission = Some(Arc::new(check));
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn check_permissions(&self, input: &ToolArguments, _ctx: &ToolContext) -> PermissionCheck {
        match &self.permission {
            Some(check) => check(input),
            None => PermissionCheck::allow(),
        }
    }

    async fn execute(
        &self,
        input: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, RuntimeError> {
        (self.handler)(input.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("has_permission_check", &self.permission.is_some())
            .finish()
    }
}
