use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::agent_loop::events::{EventPayload, SessionEvent};
use crate::agent_loop::runner::{ConversationLoop, TurnContext};
use crate::config::RuntimeConfig;
use crate::provider::{ScriptedCall, ScriptedProvider};
use crate::session::state::SessionState;
use crate::session::transport::{ChannelTransport, Transport};
use crate::tools::{AgentTool, Tool, ToolOutput, ToolSchema};
use crate::types::{ContentBlock, Message, ToolResultBlock};

pub(super) const MODEL: &str = "claude-sonnet-4-5";

pub(super) fn provider(calls: Vec<ScriptedCall>) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(calls))
}

pub(super) fn runner(provider: &Arc<ScriptedProvider>) -> ConversationLoop {
    runner_with_config(provider, RuntimeConfig::default())
}

pub(super) fn runner_with_config(
    provider: &Arc<ScriptedProvider>,
    config: RuntimeConfig,
) -> ConversationLoop {
    ConversationLoop::new(provider.clone(), config)
}

pub(super) fn session() -> SessionState {
    SessionState::new("session-1", MODEL)
}

pub(super) fn headless() -> TurnContext {
    TurnContext::builder().build()
}

/// A transport whose events can be drained after the run.
pub(super) fn capture_events() -> (Arc<dyn Transport>, EventLog) {
    let (transport, rx) = ChannelTransport::new();
    (Arc::new(transport), EventLog { rx })
}

pub(super) struct EventLog {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventLog {
    pub(super) fn drain(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub(super) fn payloads(&mut self) -> Vec<EventPayload> {
        self.drain().into_iter().map(|event| event.payload).collect()
    }
}

/// A tool that records the inputs it was called with.
pub(super) struct RecordingTool {
    pub calls: Arc<AtomicUsize>,
    pub inputs: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl RecordingTool {
    pub(super) fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(super) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(super) fn inputs(&self) -> Vec<serde_json::Value> {
        self.inputs.lock().unwrap().clone()
    }

    /// A tool named `name` that answers every call with `output`.
    pub(super) fn tool(&self, name: &str, output: &str) -> Arc<dyn Tool> {
        let calls = self.calls.clone();
        let inputs = self.inputs.clone();
        let output = output.to_string();
        Arc::new(AgentTool::new(
            name,
            "test tool",
            ToolSchema::empty(),
            move |args, _ctx| {
                calls.fetch_add(1, Ordering::SeqCst);
                inputs.lock().unwrap().push(args.raw().clone());
                let output = output.clone();
                async move { Ok(ToolOutput::text(output)) }
            },
        ))
    }
}

/// Filler history of `count` alternating messages with `chars` characters each.
pub(super) fn filler_history(count: usize, chars: usize) -> Vec<Message> {
    (0..count)
        .map(|i| {
            let body = format!("{i}:{}", "x".repeat(chars));
            if i % 2 == 0 {
                Message::user(body)
            } else {
                Message::assistant(body)
            }
        })
        .collect()
}

pub(super) fn tool_results(message: &Message) -> Vec<ToolResultBlock> {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult(result) => Some(result.clone()),
            _ => None,
        })
        .collect()
}

/// Every tool_use in `messages` is answered by a tool_result in the next message.
pub(super) fn assert_tool_pairing(messages: &[Message]) {
    for (idx, message) in messages.iter().enumerate() {
        let uses = message.tool_uses();
        if uses.is_empty() {
            continue;
        }
        let next = messages
            .get(idx + 1)
            .unwrap_or_else(|| panic!("tool_use at message {idx} has no result message"));
        let answered: Vec<String> = tool_results(next)
            .into_iter()
            .map(|result| result.tool_use_id)
            .collect();
        for tool_use in uses {
            assert!(
                answered.contains(&tool_use.id),
                "tool_use {} is unanswered",
                tool_use.id
            );
        }
    }
}
