//! Tests for the session coordinator.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use turnloop::agent_loop::EventPayload;
use turnloop::config::RuntimeConfig;
use turnloop::error::RuntimeError;
use turnloop::provider::ScriptedCall;
use turnloop::session::{ChannelTransport, SessionOptions, Transport};
use turnloop::tools::ToolFilter;
use turnloop::types::{Role, StopReason};

#[tokio::test]
async fn turn_runs_and_history_is_kept() {
    let (coordinator, provider) = coordinator(vec![ScriptedCall::text_reply("Hi!")]);
    let id = coordinator
        .create_session(SessionOptions::builder().id("alpha").build())
        .await
        .expect("create");

    let outcome = coordinator.send_message(&id, "hello").await.expect("turn");

    assert_eq!(outcome.text(), "Hi!");
    let messages = coordinator.messages(&id).await.expect("messages");
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(provider.requests()[0].model, MODEL);
    assert_eq!(coordinator.session_ids(), vec!["alpha".to_string()]);
}

#[tokio::test]
async fn generated_ids_are_unique_and_duplicates_rejected() {
    let (coordinator, _) = coordinator(Vec::new());
    let first = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    let second = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    assert_ne!(first, second);

    let err = coordinator
        .create_session(SessionOptions::builder().id(first.clone()).build())
        .await
        .expect_err("duplicate");
    assert!(matches!(err, RuntimeError::InvalidState(_)));
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (coordinator, _) = coordinator(Vec::new());
    let err = coordinator
        .send_message("missing", "hello")
        .await
        .expect_err("not found");
    assert!(matches!(err, RuntimeError::SessionNotFound(id) if id == "missing"));
    assert!(matches!(
        coordinator.cancel("missing"),
        Err(RuntimeError::SessionNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn busy_session_rejects_concurrent_work() {
    let (coordinator, provider) = coordinator(vec![
        slow_reply(Duration::from_secs(30)),
        ScriptedCall::text_reply("second"),
    ]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    let handle = coordinator.handle(&id).await.expect("handle");

    let running = coordinator
        .spawn_message(&id, "slow question")
        .await
        .expect("spawn");
    until_processing(&handle).await;

    assert!(matches!(
        coordinator.send_message(&id, "again").await,
        Err(RuntimeError::SessionBusy(_))
    ));
    assert!(matches!(
        coordinator.spawn_message(&id, "again").await,
        Err(RuntimeError::SessionBusy(_))
    ));
    assert!(matches!(
        coordinator.delete_session(&id).await,
        Err(RuntimeError::SessionBusy(_))
    ));
    let (transport, _rx) = ChannelTransport::new();
    let transport: Arc<dyn Transport> = Arc::new(transport);
    assert!(matches!(
        coordinator.bind_transport(&id, Some(transport.clone())).await,
        Err(RuntimeError::InvalidState(_))
    ));

    let outcome = running.await.expect("join").expect("turn");
    assert_eq!(outcome.stop_reason, StopReason::EndTurn);
    assert!(!handle.is_processing());

    coordinator
        .bind_transport(&id, Some(transport))
        .await
        .expect("rebind once idle");
    let outcome = coordinator.send_message(&id, "again").await.expect("turn");
    assert_eq!(outcome.text(), "second");
    assert_eq!(provider.stream_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn back_to_back_spawns_reject_the_second() {
    let (coordinator, provider) = coordinator(vec![
        slow_reply(Duration::from_secs(30)),
        ScriptedCall::text_reply("never sent"),
    ]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");

    let first = coordinator.spawn_message(&id, "one").await;
    let second = coordinator.spawn_message(&id, "two").await;

    assert!(matches!(second, Err(RuntimeError::SessionBusy(_))));
    let outcome = first.expect("spawn").await.expect("join").expect("turn");
    assert_eq!(outcome.text(), "thinking about it, done");
    assert_eq!(provider.stream_count(), 1);
}

#[tokio::test]
async fn cancel_right_after_spawn_reaches_the_new_turn() {
    let (coordinator, provider) = coordinator(vec![ScriptedCall::text_reply("unreachable")]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");

    let running = coordinator.spawn_message(&id, "hello").await.expect("spawn");
    assert!(coordinator.cancel(&id).expect("cancel"));

    let outcome = running.await.expect("join").expect("canceled outcome");
    assert!(outcome.is_canceled());
    assert_eq!(provider.stream_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_the_running_turn_and_clears_the_flag() {
    let (coordinator, _) = coordinator(vec![slow_reply(Duration::from_secs(30))]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    let handle = coordinator.handle(&id).await.expect("handle");

    let running = coordinator
        .spawn_message(&id, "slow question")
        .await
        .expect("spawn");
    until_processing(&handle).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(coordinator.cancel(&id).expect("cancel"));
    let outcome = running.await.expect("join").expect("canceled outcome");

    assert!(outcome.is_canceled());
    assert_eq!(outcome.text(), "thinking about it");
    assert!(!handle.is_processing());
    assert!(!coordinator.cancel(&id).expect("cancel"));
    let messages = coordinator.messages(&id).await.expect("messages");
    assert_eq!(messages.last().map(|m| m.text()), Some("thinking about it".to_string()));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_in_flight_turns() {
    let (coordinator, _) = coordinator(vec![slow_reply(Duration::from_secs(30))]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    let handle = coordinator.handle(&id).await.expect("handle");

    let running = coordinator
        .spawn_message(&id, "slow question")
        .await
        .expect("spawn");
    until_processing(&handle).await;

    coordinator.shutdown().await;

    assert!(!handle.is_processing());
    let outcome = running.await.expect("join").expect("canceled outcome");
    assert!(outcome.is_canceled());
}

#[tokio::test]
async fn failed_turn_leaves_session_usable() {
    let (coordinator, _) = coordinator(vec![
        ScriptedCall::open_failure(turnloop::provider::ScriptedError::Api {
            status: 401,
            message: "invalid x-api-key".to_string(),
        }),
        ScriptedCall::text_reply("recovered"),
    ]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");

    assert!(coordinator.send_message(&id, "first").await.is_err());
    let handle = coordinator.handle(&id).await.expect("handle");
    assert!(!handle.is_processing());

    let outcome = coordinator.send_message(&id, "second").await.expect("turn");
    assert_eq!(outcome.text(), "recovered");
}

#[tokio::test]
async fn bound_transport_receives_session_events() {
    let (coordinator, _) = coordinator(vec![ScriptedCall::text_reply("Hello there")]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    let (transport, mut rx) = ChannelTransport::new();
    coordinator
        .bind_transport(&id, Some(Arc::new(transport)))
        .await
        .expect("bind");

    coordinator.send_message(&id, "hi").await.expect("turn");

    let mut payloads = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.session_id, id);
        payloads.push(event.payload);
    }
    assert!(payloads.contains(&EventPayload::TextDelta {
        text: "Hello there".to_string()
    }));
    assert!(matches!(
        payloads.last(),
        Some(EventPayload::Completion {
            stop_reason: StopReason::EndTurn,
            ..
        })
    ));
}

#[tokio::test]
async fn event_sequence_continues_across_turns() {
    let (coordinator, _) = coordinator(vec![
        ScriptedCall::text_reply("first"),
        ScriptedCall::text_reply("second"),
    ]);
    let id = coordinator
        .create_session(SessionOptions::default())
        .await
        .expect("create");
    let (transport, mut rx) = ChannelTransport::new();
    coordinator
        .bind_transport(&id, Some(Arc::new(transport)))
        .await
        .expect("bind");

    coordinator.send_message(&id, "one").await.expect("turn");
    coordinator.send_message(&id, "two").await.expect("turn");

    let mut seqs = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seqs.push(event.seq);
    }
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert!(seqs.len() > 4);
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn creating_over_a_stored_session_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RuntimeConfig {
        session_dir: Some(dir.path().to_path_buf()),
        ..RuntimeConfig::default()
    };
    let (first, _) = coordinator_with(vec![ScriptedCall::text_reply("noted")], config.clone());
    first
        .create_session(SessionOptions::builder().id("kept").build())
        .await
        .expect("create");
    first.send_message("kept", "remember this").await.expect("turn");

    let (restarted, _) = coordinator_with(Vec::new(), config);
    let err = restarted
        .create_session(SessionOptions::builder().id("kept").build())
        .await
        .expect_err("already stored");

    assert!(matches!(err, RuntimeError::InvalidState(_)));
    let messages = restarted.messages("kept").await.expect("history survives");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text(), "noted");
}

#[tokio::test]
async fn sessions_persist_to_disk_and_load_lazily() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = RuntimeConfig {
        session_dir: Some(dir.path().to_path_buf()),
        ..RuntimeConfig::default()
    };

    let (first, _) = coordinator_with(vec![ScriptedCall::text_reply("noted")], config.clone());
    first
        .create_session(
            SessionOptions::builder()
                .id("persisted")
                .system_prompt("Be brief.")
                .tool_filter(ToolFilter::default().disable("bash"))
                .build(),
        )
        .await
        .expect("create");
    first
        .send_message("persisted", "remember this")
        .await
        .expect("turn");
    assert!(dir.path().join("persisted.json").exists());

    let (second, _) = coordinator_with(vec![ScriptedCall::text_reply("still here")], config);
    assert!(second.session_ids().is_empty());
    let messages = second.messages("persisted").await.expect("lazy load");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text(), "noted");

    let handle = second.handle("persisted").await.expect("handle");
    assert_eq!(handle.id(), "persisted");
    second
        .send_message("persisted", "and this")
        .await
        .expect("turn");
    assert_eq!(second.messages("persisted").await.expect("messages").len(), 4);

    second.delete_session("persisted").await.expect("delete");
    assert!(!dir.path().join("persisted.json").exists());
    assert!(matches!(
        second.messages("persisted").await,
        Err(RuntimeError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn coordinator_is_shareable_across_tasks() {
    let (coordinator, _) = coordinator(vec![
        ScriptedCall::text_reply("one"),
        ScriptedCall::text_reply("two"),
    ]);
    let a = coordinator
        .create_session(SessionOptions::builder().id("a").build())
        .await
        .expect("create");
    let b = coordinator
        .create_session(SessionOptions::builder().id("b").build())
        .await
        .expect("create");

    let first = coordinator.spawn_message(&a, "hi").await.expect("spawn");
    let second = coordinator.spawn_message(&b, "hi").await.expect("spawn");
    let mut texts = vec![
        first.await.expect("join").expect("turn").text(),
        second.await.expect("join").expect("turn").text(),
    ];
    texts.sort();
    assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
}
