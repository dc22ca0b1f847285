use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use super::support::*;
use crate::agent_loop::compaction::{CompactionStrategy, SessionMemory};
use crate::agent_loop::estimator::estimate_message_tokens;
use crate::agent_loop::events::{CompactionPhase, CompactionTrigger, EventPayload};
use crate::agent_loop::runner::{ConversationLoop, TurnContext};
use crate::config::RuntimeConfig;
use crate::provider::{ScriptedCall, ScriptedError, ScriptedProvider};
use crate::session::state::SessionState;

const TINY_MODEL: &str = "tiny-model";

/// 80k-token window, so compaction triggers at 64k.
fn tiny_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.context_windows.insert(TINY_MODEL.to_string(), 80_000);
    config
}

fn tiny_session(history: usize, chars: usize) -> SessionState {
    SessionState::new("session-1", TINY_MODEL).with_messages(filler_history(history, chars))
}

fn compaction_phases(payloads: &[EventPayload]) -> Vec<(CompactionPhase, CompactionTrigger)> {
    payloads
        .iter()
        .filter_map(|payload| match payload {
            EventPayload::ContextCompaction { phase, trigger, .. } => Some((*phase, *trigger)),
            _ => None,
        })
        .collect()
}

struct FixedMemory(&'static str);

#[async_trait]
impl SessionMemory for FixedMemory {
    async fn current_summary(&self, _session_id: &str) -> Option<String> {
        Some(self.0.to_string())
    }
}

#[tokio::test]
async fn history_over_threshold_is_summarized_before_the_call() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![ScriptedCall::text_reply("Picking up where we left off.")])
            .with_summary("Goal: port the lexer. Done: tokens. Next: parser."),
    );
    let runner = runner_with_config(&provider, tiny_config());
    let (transport, mut log) = capture_events();
    let mut session = tiny_session(36, 8_000);

    runner
        .run(
            &mut session,
            TurnContext::builder().transport(transport).build(),
            "continue",
        )
        .await
        .expect("turn");

    let summary_requests = provider.summary_requests();
    assert_eq!(summary_requests.len(), 1);
    let prompt = summary_requests[0].messages[0].text();
    for section in [
        "## User requests",
        "## Actions taken",
        "## Key decisions",
        "## Current state",
        "## Errors and resolutions",
    ] {
        assert!(prompt.contains(section), "summary prompt lacks {section}");
    }
    assert!(prompt.starts_with("<conversation>"));
    let sent = &provider.requests()[0].messages;
    assert_eq!(sent.len(), 1);
    assert!(estimate_message_tokens(&sent[0]) < 32_000);
    assert!(sent[0].text().contains("Next: parser."));
    assert_eq!(session.messages.len(), 2);

    let payloads = log.payloads();
    assert_eq!(
        compaction_phases(&payloads),
        vec![
            (CompactionPhase::Start, CompactionTrigger::Estimate),
            (CompactionPhase::End, CompactionTrigger::Estimate),
        ]
    );
    let strategy = payloads.iter().find_map(|payload| match payload {
        EventPayload::ContextCompaction {
            phase: CompactionPhase::End,
            strategy,
            ..
        } => *strategy,
        _ => None,
    });
    assert_eq!(strategy, Some(CompactionStrategy::ModelSummary));
}

#[tokio::test]
async fn reported_usage_triggers_compaction_and_resets() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![ScriptedCall::text_reply("ok")]).with_summary("short summary"),
    );
    let runner = runner_with_config(&provider, tiny_config());
    let (transport, mut log) = capture_events();
    let mut session = tiny_session(10, 2_000);
    session.last_input_tokens = 90_000;

    runner
        .run(
            &mut session,
            TurnContext::builder().transport(transport).build(),
            "continue",
        )
        .await
        .expect("turn");

    assert_eq!(
        compaction_phases(&log.payloads()),
        vec![
            (CompactionPhase::Start, CompactionTrigger::ReportedUsage),
            (CompactionPhase::End, CompactionTrigger::ReportedUsage),
        ]
    );
    // Reset by compaction, then overwritten by the reply's usage.
    assert_eq!(session.last_input_tokens, 100);
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn session_memory_is_preferred_over_model_summary() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedCall::text_reply("ok")]));
    let runner: ConversationLoop = runner_with_config(&provider, tiny_config())
        .with_session_memory(Arc::new(FixedMemory("Working on the lexer port.")));
    let mut session = tiny_session(36, 8_000);

    runner
        .run(&mut session, headless(), "continue")
        .await
        .expect("turn");

    assert!(provider.summary_requests().is_empty());
    assert!(session.messages[0]
        .text()
        .contains("Working on the lexer port."));
    assert_eq!(session.messages.len(), 2);
}

#[tokio::test]
async fn proactive_compaction_failure_proceeds_uncompacted() {
    let provider = Arc::new(
        ScriptedProvider::new(vec![ScriptedCall::text_reply("ok")])
            .with_summary_failure(ScriptedError::Provider("summarizer offline".to_string())),
    );
    let runner = runner_with_config(&provider, tiny_config());
    let (transport, mut log) = capture_events();
    let mut session = tiny_session(36, 8_000);

    let outcome = runner
        .run(
            &mut session,
            TurnContext::builder().transport(transport).build(),
            "continue",
        )
        .await
        .expect("turn proceeds");

    assert_eq!(outcome.text(), "ok");
    assert_eq!(provider.requests()[0].messages.len(), 37);
    assert_eq!(session.messages.len(), 38);
    assert_eq!(
        compaction_phases(&log.payloads()),
        vec![
            (CompactionPhase::Start, CompactionTrigger::Estimate),
            (CompactionPhase::Error, CompactionTrigger::Estimate),
        ]
    );
}

#[tokio::test]
async fn disabled_compaction_never_summarizes() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedCall::text_reply("ok")]));
    let mut config = tiny_config();
    config.compaction.enabled = false;
    let runner = runner_with_config(&provider, config);
    let mut session = tiny_session(36, 8_000);

    runner
        .run(&mut session, headless(), "continue")
        .await
        .expect("turn");

    assert!(provider.summary_requests().is_empty());
    assert_eq!(session.messages.len(), 38);
}
