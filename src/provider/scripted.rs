//! Scripted provider that replays canned streams.
//!
//! Used by the runtime's own tests and available to downstream crates that
//! need a deterministic provider.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::{ModelProvider, ProviderRequest};
use crate::error::RuntimeError;
use crate::types::{StopReason, StreamEvent};

/// Error a script can inject, converted into a [`RuntimeError`] on replay.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedError {
    Network(String),
    Api { status: u16, message: String },
    Provider(String),
}

impl ScriptedError {
    pub fn prompt_too_long() -> Self {
        Self::Api {
            status: 400,
            message: "prompt is too long: 210000 tokens > 200000 maximum".to_string(),
        }
    }

    fn to_error(&self, provider: &str) -> RuntimeError {
        match self {
            Self::Network(message) => RuntimeError::Network(message.clone()),
            Self::Api { status, message } => RuntimeError::api(*status, message.clone()),
            Self::Provider(message) => RuntimeError::provider(provider, message.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum ScriptItem {
    Event(StreamEvent),
    Fail(ScriptedError),
    Delay(Duration),
}

/// The script for one `stream` call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedCall {
    open_error: Option<ScriptedError>,
    items: Vec<ScriptItem>,
}

impl ScriptedCall {
    pub fn events(events: Vec<StreamEvent>) -> Self {
        Self {
            open_error: None,
            items: events.into_iter().map(ScriptItem::Event).collect(),
        }
    }

    /// The call fails before any event is produced.
    pub fn open_failure(error: ScriptedError) -> Self {
        Self {
            open_error: Some(error),
            items: Vec::new(),
        }
    }

    /// A plain text answer ending the turn.
    pub fn text_reply(text: impl Into<String>) -> Self {
        Self::events(vec![
            StreamEvent::text(text),
            StreamEvent::usage(100, 20),
            StreamEvent::stop(StopReason::EndTurn),
        ])
    }

    /// A single tool call whose JSON input arrives in `chunk`-sized fragments.
    pub fn tool_call(id: &str, name: &str, input: &serde_json::Value, chunk: usize) -> Self {
        let raw = input.to_string();
        let mut events = vec![StreamEvent::tool_use_start(id, name)];
        let chars: Vec<char> = raw.chars().collect();
        for fragment in chars.chunks(chunk.max(1)) {
            events.push(StreamEvent::tool_use_delta(
                id,
                fragment.iter().collect::<String>(),
            ));
        }
        events.push(StreamEvent::usage(100, 20));
        events.push(StreamEvent::stop(StopReason::ToolUse));
        Self::events(events)
    }

    pub fn push_event(mut self, event: StreamEvent) -> Self {
        self.items.push(ScriptItem::Event(event));
        self
    }

    /// Fail the stream after the events pushed so far.
    pub fn then_fail(mut self, error: ScriptedError) -> Self {
        self.items.push(ScriptItem::Fail(error));
        self
    }

    /// Pause before the next scripted item.
    pub fn then_delay(mut self, delay: Duration) -> Self {
        self.items.push(ScriptItem::Delay(delay));
        self
    }
}

/// Provider double that replays a queue of [`ScriptedCall`]s in order.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    calls: Mutex<VecDeque<ScriptedCall>>,
    summaries: Mutex<VecDeque<Result<String, ScriptedError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    summary_requests: Mutex<Vec<ProviderRequest>>,
    stream_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(calls: Vec<ScriptedCall>) -> Self {
        Self {
            calls: Mutex::new(calls.into()),
            ..Self::default()
        }
    }

    /// Queue a summary returned by the next `complete` call.
    pub fn with_summary(self, summary: impl Into<String>) -> Self {
        self.push_summary(Ok(summary.into()));
        self
    }

    /// Queue a failure for the next `complete` call.
    pub fn with_summary_failure(self, error: ScriptedError) -> Self {
        self.push_summary(Err(error));
        self
    }

    fn push_summary(&self, entry: Result<String, ScriptedError>) {
        if let Ok(mut summaries) = self.summaries.lock() {
            summaries.push_back(entry);
        }
    }

    pub fn push_call(&self, call: ScriptedCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push_back(call);
        }
    }

    /// Number of `stream` calls made so far, including failed ones.
    pub fn stream_count(&self) -> usize {
        self.stream_count.load(Ordering::SeqCst)
    }

    /// Every streaming request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Every summarization request received, in order.
    pub fn summary_requests(&self) -> Vec<ProviderRequest> {
        self.summary_requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent, RuntimeError>>, RuntimeError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.stream_count.fetch_add(1, Ordering::SeqCst);
        let call = self
            .calls
            .lock()
            .ok()
            .and_then(|mut calls| calls.pop_front())
            .ok_or_else(|| RuntimeError::provider("scripted", "script exhausted"))?;
        if let Some(error) = call.open_error {
            return Err(error.to_error(self.provider_name()));
        }

        let provider = self.provider_name().to_string();
        let items = call.items;
        let stream = async_stream::stream! {
            for item in items {
                match item {
                    ScriptItem::Event(event) => {
                        yield Ok(event);
                    }
                    ScriptItem::Delay(delay) => {
                        tokio::time::sleep(delay).await;
                    }
                    ScriptItem::Fail(error) => {
                        yield Err(error.to_error(&provider));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<String, RuntimeError> {
        if let Ok(mut requests) = self.summary_requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .summaries
            .lock()
            .ok()
            .and_then(|mut summaries| summaries.pop_front());
        match next {
            Some(Ok(summary)) => Ok(summary),
            Some(Err(error)) => Err(error.to_error(self.provider_name())),
            None => Err(RuntimeError::provider("scripted", "no summary scripted")),
        }
    }
}
