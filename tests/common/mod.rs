//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use turnloop::config::RuntimeConfig;
use turnloop::provider::{ScriptedCall, ScriptedProvider};
use turnloop::session::{SessionCoordinator, SessionHandle};
use turnloop::tools::{AgentTool, Tool, ToolOutput, ToolSchema};
use turnloop::types::{StopReason, StreamEvent};

pub const MODEL: &str = "claude-sonnet-4-5";

/// A coordinator over a scripted provider, with the given config.
pub fn coordinator_with(
    calls: Vec<ScriptedCall>,
    config: RuntimeConfig,
) -> (Arc<SessionCoordinator>, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new(calls));
    let coordinator = SessionCoordinator::from_config(provider.clone(), config);
    (Arc::new(coordinator), provider)
}

pub fn coordinator(calls: Vec<ScriptedCall>) -> (Arc<SessionCoordinator>, Arc<ScriptedProvider>) {
    coordinator_with(calls, RuntimeConfig::default())
}

/// A reply that stalls for `delay` after its first chunk.
pub fn slow_reply(delay: Duration) -> ScriptedCall {
    ScriptedCall::events(vec![StreamEvent::text("thinking about it")])
        .then_delay(delay)
        .push_event(StreamEvent::text(", done"))
        .push_event(StreamEvent::stop(StopReason::EndTurn))
}

/// Yield until a turn has started on `handle`.
pub async fn until_processing(handle: &SessionHandle) {
    while !handle.is_processing() {
        tokio::task::yield_now().await;
    }
}

/// A tool that counts its executions.
pub fn counting_tool(name: &str, calls: Arc<AtomicUsize>) -> AgentTool {
    AgentTool::new(name, "counts calls", ToolSchema::empty(), move |_args, _ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(ToolOutput::text("ok")) }
    })
}

pub fn shared(tool: AgentTool) -> Arc<dyn Tool> {
    Arc::new(tool)
}
