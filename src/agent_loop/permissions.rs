//! Permission gate for tool execution.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

use super::events::{EventEmitter, EventPayload};
use crate::error::RuntimeError;
use crate::tools::{Tool, ToolArguments, ToolContext};
use crate::util::timeout::with_timeout;

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionBehavior {
    Allow,
    Deny,
    Ask,
}

/// What a tool's own permission check returns.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionCheck {
    pub behavior: PermissionBehavior,
    pub reason: Option<String>,
    /// Replacement input, e.g. a normalized path.
    pub updated_input: Option<serde_json::Value>,
    /// Cache an `Allow`/`Deny` for the rest of the session.
    pub remember: bool,
}

impl PermissionCheck {
    pub fn allow() -> Self {
        Self {
            behavior: PermissionBehavior::Allow,
            reason: None,
            updated_input: None,
            remember: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Deny,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            behavior: PermissionBehavior::Ask,
            reason: Some(reason.into()),
            ..Self::allow()
        }
    }

    pub fn with_updated_input(mut self, input: serde_json::Value) -> Self {
        self.updated_input = Some(input);
        self
    }

    pub fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }
}

/// A cached session-scoped decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionDecision {
    pub behavior: PermissionBehavior,
    pub reason: Option<String>,
    /// Input rewrite from the tool's check, reapplied on every cache hit.
    pub updated_input: Option<serde_json::Value>,
}

/// Interactive permission request sent to the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRequest {
    pub id: String,
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A user's answer to a [`PermissionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PermissionReply {
    Allow,
    AllowForSession,
    Deny {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DenyForSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Session-scoped decision cache keyed by tool name and input fingerprint.
#[derive(Debug, Default)]
pub struct PermissionCache {
    entries: Mutex<HashMap<String, PermissionDecision>>,
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `tool:sha256(canonical input)`. Object keys serialize sorted, so
    /// key order in the model's JSON does not matter.
    pub fn key(tool_name: &str, input: &serde_json::Value) -> String {
        let canonical = serde_json::to_string(input).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        format!("{tool_name}:{hex}")
    }

    pub fn get(&self, key: &str) -> Option<PermissionDecision> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    pub fn insert(&self, key: String, decision: PermissionDecision) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, decision);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

/// Decides whether a tool call may run: cache, then the tool's own check,
/// then an interactive round trip when the answer is `Ask`.
#[derive(Debug, Clone)]
pub struct PermissionGate {
    request_timeout: Duration,
}

impl PermissionGate {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Returns the (possibly rewritten) input to execute with, or the
    /// tool-level error describing the refusal.
    pub async fn authorize(
        &self,
        tool: &dyn Tool,
        input: ToolArguments,
        ctx: &ToolContext,
        cache: &PermissionCache,
        emitter: &EventEmitter,
    ) -> Result<ToolArguments, RuntimeError> {
        let tool_name = tool.name().to_string();
        let key = PermissionCache::key(&tool_name, input.raw());

        if let Some(decision) = cache.get(&key) {
            tracing::debug!(tool = %tool_name, behavior = %decision.behavior, "permission cache hit");
            return match decision.behavior {
                PermissionBehavior::Deny => Err(RuntimeError::PermissionDenied {
                    tool_name,
                    reason: decision.reason,
                }),
                _ => Ok(decision.updated_input.map_or(input, ToolArguments::new)),
            };
        }

        let check = tool.check_permissions(&input, ctx).await;
        let updated_input = check.updated_input.clone();
        let input = match check.updated_input {
            Some(updated) => ToolArguments::new(updated),
            None => input,
        };

        match check.behavior {
            PermissionBehavior::Allow => {
                if check.remember {
                    cache.insert(key, allowed(updated_input));
                }
                Ok(input)
            }
            PermissionBehavior::Deny => {
                if check.remember {
                    cache.insert(key, denied(check.reason.clone()));
                }
                Err(RuntimeError::PermissionDenied {
                    tool_name,
                    reason: check.reason,
                })
            }
            PermissionBehavior::Ask => {
                let pending = PendingAsk {
                    tool_name,
                    input,
                    updated_input,
                    reason: check.reason,
                    key,
                };
                self.ask(pending, ctx, cache, emitter).await
            }
        }
    }

    async fn ask(
        &self,
        pending: PendingAsk,
        ctx: &ToolContext,
        cache: &PermissionCache,
        emitter: &EventEmitter,
    ) -> Result<ToolArguments, RuntimeError> {
        let PendingAsk {
            tool_name,
            input,
            updated_input,
            reason,
            key,
        } = pending;
        let Some(transport) = emitter.transport() else {
            tracing::warn!(
                session_id = %ctx.session_id,
                tool = %tool_name,
                "permission ask with no transport attached; allowing"
            );
            return Ok(input);
        };

        let request = PermissionRequest {
            id: ctx.store.next_id("perm"),
            tool_use_id: ctx.tool_use_id.clone(),
            tool_name: tool_name.clone(),
            input: input.raw().clone(),
            reason,
        };
        emitter.emit(EventPayload::PermissionRequest {
            request: request.clone(),
        });

        let reply = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(RuntimeError::Canceled),
            reply = with_timeout(self.request_timeout, transport.request_permission(request)) => reply,
        };

        match reply {
            Ok(PermissionReply::Allow) => Ok(input),
            Ok(PermissionReply::AllowForSession) => {
                cache.insert(key, allowed(updated_input));
                Ok(input)
            }
            Ok(PermissionReply::Deny { reason }) => {
                Err(RuntimeError::PermissionDenied { tool_name, reason })
            }
            Ok(PermissionReply::DenyForSession { reason }) => {
                cache.insert(key, denied(reason.clone()));
                Err(RuntimeError::PermissionDenied { tool_name, reason })
            }
            Err(RuntimeError::Timeout(_)) => {
                tracing::warn!(tool = %tool_name, "permission request timed out; denying");
                Err(RuntimeError::PermissionTimeout {
                    tool_name,
                    timeout_secs: self.request_timeout.as_secs(),
                })
            }
            Err(err) => Err(RuntimeError::PermissionDenied {
                tool_name,
                reason: Some(err.to_string()),
            }),
        }
    }
}

/// An `Ask` waiting on the transport. The cache key is the pre-rewrite input.
struct PendingAsk {
    tool_name: String,
    input: ToolArguments,
    updated_input: Option<serde_json::Value>,
    reason: Option<String>,
    key: String,
}

fn allowed(updated_input: Option<serde_json::Value>) -> PermissionDecision {
    PermissionDecision {
        behavior: PermissionBehavior::Allow,
        reason: None,
        updated_input,
    }
}

fn denied(reason: Option<String>) -> PermissionDecision {
    PermissionDecision {
        behavior: PermissionBehavior::Deny,
        reason,
        updated_input: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use crate::session::tracker::RuntimeStore;
    use crate::session::transport::{ChannelTransport, Transport};
    use crate::tools::{AgentTool, ToolOutput, ToolSchema};

    fn tool_with_check(check: PermissionCheck, calls: Arc<AtomicUsize>) -> AgentTool {
        AgentTool::new("write_file", "write", ToolSchema::empty(), |_args, _ctx| async {
            Ok(ToolOutput::text("written"))
        })
        .with_permission_check(move |_input| {
            calls.fetch_add(1, Ordering::SeqCst);
            check.clone()
        })
    }

    fn ctx() -> ToolContext {
        ToolContext {
            session_id: "s1".to_string(),
            tool_use_id: "toolu_1".to_string(),
            cancel: CancellationToken::new(),
            store: Arc::new(RuntimeStore::new()),
        }
    }

    fn input() -> ToolArguments {
        ToolArguments::new(serde_json::json!({"path": "/tmp/a", "content": "x"}))
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = serde_json::json!({"a": 1, "b": [1, 2]});
        let b: serde_json::Value = serde_json::from_str(r#"{"b": [1, 2], "a": 1}"#).expect("json");
        assert_eq!(PermissionCache::key("t", &a), PermissionCache::key("t", &b));
        assert_ne!(PermissionCache::key("t", &a), PermissionCache::key("u", &a));
    }

    #[tokio::test]
    async fn deny_returns_permission_denied_with_reason() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = tool_with_check(PermissionCheck::deny("outside workspace"), calls);
        let gate = PermissionGate::new(Duration::from_secs(5));
        let err = gate
            .authorize(&tool, input(), &ctx(), &PermissionCache::new(), &EventEmitter::detached("s1"))
            .await
            .expect_err("denied");
        assert_eq!(
            err.to_string(),
            "Permission denied for tool 'write_file': outside workspace"
        );
    }

    #[tokio::test]
    async fn ask_without_transport_allows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = tool_with_check(PermissionCheck::ask("writes a file"), calls);
        let gate = PermissionGate::new(Duration::from_secs(5));
        let allowed = gate
            .authorize(&tool, input(), &ctx(), &PermissionCache::new(), &EventEmitter::detached("s1"))
            .await
            .expect("allowed");
        assert_eq!(allowed, input());
    }

    #[tokio::test]
    async fn updated_input_replaces_original() {
        let calls = Arc::new(AtomicUsize::new(0));
        let normalized = serde_json::json!({"path": "/private/tmp/a", "content": "x"});
        let tool = tool_with_check(
            PermissionCheck::allow().with_updated_input(normalized.clone()),
            calls,
        );
        let gate = PermissionGate::new(Duration::from_secs(5));
        let allowed = gate
            .authorize(&tool, input(), &ctx(), &PermissionCache::new(), &EventEmitter::detached("s1"))
            .await
            .expect("allowed");
        assert_eq!(allowed.raw(), &normalized);
    }

    #[tokio::test]
    async fn remembered_rewrite_applies_on_cache_hits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let normalized = serde_json::json!({"path": "/private/tmp/a", "content": "x"});
        let tool = tool_with_check(
            PermissionCheck::allow()
                .with_updated_input(normalized.clone())
                .remembered(),
            calls.clone(),
        );
        let cache = PermissionCache::new();
        let emitter = EventEmitter::detached("s1");
        let gate = PermissionGate::new(Duration::from_secs(5));

        let first = gate
            .authorize(&tool, input(), &ctx(), &cache, &emitter)
            .await
            .expect("first allowed");
        let second = gate
            .authorize(&tool, input(), &ctx(), &cache, &emitter)
            .await
            .expect("second allowed");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.raw(), &normalized);
        assert_eq!(second.raw(), &normalized);
    }

    #[tokio::test]
    async fn allow_for_session_keeps_the_rewrite() {
        let calls = Arc::new(AtomicUsize::new(0));
        let normalized = serde_json::json!({"path": "/private/tmp/a", "content": "x"});
        let tool = tool_with_check(
            PermissionCheck::ask("writes a file").with_updated_input(normalized.clone()),
            calls,
        );
        let (transport, _events) = ChannelTransport::new();
        let transport = transport.with_permission_responder(Arc::new(|_request| {
            Box::pin(async { PermissionReply::AllowForSession })
        }));
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let emitter = EventEmitter::new("s1", Some(transport));
        let cache = PermissionCache::new();
        let gate = PermissionGate::new(Duration::from_secs(5));

        for _ in 0..2 {
            let allowed = gate
                .authorize(&tool, input(), &ctx(), &cache, &emitter)
                .await
                .expect("allowed");
            assert_eq!(allowed.raw(), &normalized);
        }
    }

    #[tokio::test]
    async fn allow_for_session_is_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = tool_with_check(PermissionCheck::ask("writes a file"), calls.clone());
        let (transport, mut events) = ChannelTransport::new();
        let transport = transport.with_permission_responder(Arc::new(|_request| {
            Box::pin(async { PermissionReply::AllowForSession })
        }));
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let emitter = EventEmitter::new("s1", Some(transport));
        let cache = PermissionCache::new();
        let gate = PermissionGate::new(Duration::from_secs(5));

        gate.authorize(&tool, input(), &ctx(), &cache, &emitter)
            .await
            .expect("first allowed");
        gate.authorize(&tool, input(), &ctx(), &cache, &emitter)
            .await
            .expect("second allowed");

        assert_eq!(calls.load(Ordering::SeqCst), 1, "tool check runs once");
        assert_eq!(cache.len(), 1);
        let event = events.try_recv().expect("permission event");
        assert!(matches!(event.payload, EventPayload::PermissionRequest { .. }));
        assert!(events.try_recv().is_err(), "second call hits the cache");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_as_denial() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = tool_with_check(PermissionCheck::ask("runs a command"), calls);
        let (transport, _events) = ChannelTransport::new();
        let transport = transport.with_permission_responder(Arc::new(|_request| {
            Box::pin(std::future::pending::<PermissionReply>())
        }));
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let emitter = EventEmitter::new("s1", Some(transport));
        let gate = PermissionGate::new(Duration::from_secs(30));

        let err = gate
            .authorize(&tool, input(), &ctx(), &PermissionCache::new(), &emitter)
            .await
            .expect_err("timed out");
        assert!(matches!(
            err,
            RuntimeError::PermissionTimeout { timeout_secs: 30, .. }
        ));
    }
}
