//! End-to-end turn tests with mock transport, generator and executor

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use scribble::TurnOutcome;
use scribble::actions::{
    ActionGate, ActionKind, ActionParams, ActionRequest, Authorization, DenyReason, Requester,
};
use scribble::channels::ChannelEvent;
use scribble::clock::ManualClock;
use scribble::config::SafetyConfig;
use scribble::engagement::Decision;
use scribble::store::MemoryScope;

mod common;
use common::{
    ADMIN, ALICE, BOB, MockChannel, MockGenerator, Scripted, VIP, harness, harness_with_channel,
    message, test_config,
};

fn actions(outcome: &TurnOutcome) -> Vec<(ActionKind, String)> {
    match outcome {
        TurnOutcome::Replied { actions, .. } => actions
            .iter()
            .map(|a| (a.kind, a.outcome.clone()))
            .collect(),
        other => panic!("expected a reply, got {other:?}"),
    }
}

#[tokio::test]
async fn mentioned_turn_replies_acts_and_learns() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(
        &config,
        MockGenerator::raw(&[r#"{
            "message": "done!",
            "actions": [{"type": "timeout", "target": "bob", "minutes": 5}],
            "memories": [{"content": "alice asked me to quiet bob", "importance": 0.6, "about": "user"}],
            "traits": [{"user_id": "bob", "traits": ["chatty"]}]
        }"#]),
    );

    let ignored = h
        .agent
        .process_message(message("m1", "c1", BOB, "hello all"))
        .await;
    assert!(matches!(ignored, TurnOutcome::Ignored(_)));

    let outcome = h
        .agent
        .process_message(message("m2", "c1", ALICE, "hey scribble, timeout bob for 5 minutes"))
        .await;

    let TurnOutcome::Replied {
        decision,
        memories_written,
        dossiers_updated,
        ..
    } = &outcome
    else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(*decision, Decision::RespondMentioned);
    assert_eq!(*memories_written, 1);
    assert_eq!(*dossiers_updated, 2);
    assert_eq!(actions(&outcome), vec![(ActionKind::Timeout, "executed".to_string())]);

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "done!");
    assert_eq!(sent[0].reply_to.as_deref(), Some("m2"));

    let executed = h.executor.executed();
    assert_eq!(executed[0].target_id.as_deref(), Some("2"));
    assert_eq!(executed[0].params, ActionParams::Timeout { minutes: 5 });

    let entries = h.agent.memories().entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].scope, MemoryScope::User("1".to_string()));

    let bob = h.agent.dossiers().get("2").await.unwrap();
    assert_eq!(bob.display_name, "bob");
    assert_eq!(bob.traits, vec!["chatty".to_string()]);
    assert!(h.agent.dossiers().get("1").await.is_some());

    // The context handed to the model included the earlier message
    let request = h.generator.requests.lock().unwrap()[0].clone();
    assert!(request.context.contains("bob (2): hello all"));
}

#[tokio::test]
async fn protected_and_unknown_targets_are_never_acted_on() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(
        &config,
        MockGenerator::raw(&[r#"{"message": "hmm", "actions": [
            {"type": "timeout", "target": "vip", "minutes": 5},
            {"type": "nickname", "target": "mod", "nickname": "silly"},
            {"type": "timeout", "target": "carol", "minutes": 5}
        ]}"#]),
    );

    h.agent.process_message(message("m1", "c1", VIP, "hi")).await;
    h.agent.process_message(message("m2", "c1", ADMIN, "yo")).await;
    let outcome = h
        .agent
        .process_message(message("m3", "c1", ALICE, "scribble do something"))
        .await;

    assert_eq!(
        actions(&outcome),
        vec![
            (ActionKind::Timeout, "protected-target".to_string()),
            (ActionKind::Nickname, "protected-target".to_string()),
            (ActionKind::Timeout, "unknown-target".to_string()),
        ]
    );
    assert!(h.executor.executed().is_empty());
    assert_eq!(h.agent.gate().counter("1"), None);
}

#[tokio::test]
async fn eleventh_action_in_an_hour_is_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let output = r#"{"message": "ok", "action": "timeout bob 1"}"#;
    let h = harness(&config, MockGenerator::raw(&[output; 11]));

    h.agent.process_message(message("b", "c1", BOB, "hello")).await;

    let mut last = Vec::new();
    for i in 0..11 {
        let outcome = h
            .agent
            .process_message(message(&format!("m{i}"), "c1", ALICE, "scribble, again"))
            .await;
        last = actions(&outcome);
    }

    assert_eq!(last, vec![(ActionKind::Timeout, "rate-limit".to_string())]);
    assert_eq!(h.executor.executed().len(), 10);
}

#[tokio::test]
async fn concurrent_authorizations_allow_exactly_the_cap() {
    let clock = Arc::new(ManualClock::default());
    let gate = Arc::new(ActionGate::new(SafetyConfig::default(), clock));
    let request = ActionRequest {
        kind: ActionKind::Timeout,
        target: Some("bob".to_string()),
        params: ActionParams::Timeout { minutes: 5 },
        reason: None,
    };
    let requester = Requester {
        user_id: "1".to_string(),
        display_name: "alice".to_string(),
        channel_id: "c1".to_string(),
    };

    let tasks = (0..40).map(|_| {
        let gate = Arc::clone(&gate);
        let request = request.clone();
        let requester = requester.clone();
        tokio::spawn(async move { gate.authorize(&request, Some("2"), &requester) })
    });
    let verdicts: Vec<Authorization> = join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let allowed = verdicts.iter().filter(|v| v.is_allowed()).count();
    let limited = verdicts
        .iter()
        .filter(|v| **v == Authorization::Deny(DenyReason::RateLimited))
        .count();
    assert_eq!(allowed, 10);
    assert_eq!(limited, 30);
    assert_eq!(gate.counter("1").map(|c| c.count), Some(10));
}

#[tokio::test]
async fn reset_during_generation_discards_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (generator, started, release) = MockGenerator::raw(&[
        r#"{"message": "late reply", "memories": ["should not be kept"], "action": "timeout bob 5"}"#,
    ])
    .held();
    let h = harness(&config, generator);

    h.agent.process_message(message("b", "c1", BOB, "hello")).await;

    let agent = Arc::clone(&h.agent);
    let turn = tokio::spawn(async move {
        agent
            .process_message(message("m1", "c1", ALICE, "scribble?"))
            .await
    });

    started.notified().await;
    h.agent.wake().reset("c1");
    release.notify_one();

    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);
    assert!(h.channel.sent().is_empty());
    assert!(h.executor.executed().is_empty());
    assert!(h.agent.memories().is_empty().await);
    assert!(h.agent.dossiers().is_empty().await);
}

#[tokio::test]
async fn reset_while_replying_stops_actions_and_learning() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (channel, sending, release) = MockChannel::default().held_send();
    let h = harness_with_channel(
        &config,
        MockGenerator::raw(&[
            r#"{"message": "on it", "memories": ["alice asked for quiet"], "actions": [{"type": "timeout", "target": "bob", "minutes": 5}]}"#,
        ]),
        channel,
    );

    h.agent.process_message(message("b", "c1", BOB, "hello")).await;

    let agent = Arc::clone(&h.agent);
    let turn = tokio::spawn(async move {
        agent
            .process_message(message("m1", "c1", ALICE, "scribble, quiet bob please"))
            .await
    });

    sending.notified().await;
    h.agent.wake().reset("c1");
    release.notify_one();

    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);
    assert_eq!(h.channel.sent_texts(), vec!["on it".to_string()]);
    assert!(h.executor.executed().is_empty());
    assert!(h.agent.gate().recent_records(10).is_empty());
    assert!(h.agent.memories().is_empty().await);
    assert!(h.agent.dossiers().is_empty().await);
}

fn last_recent_message(context: &str) -> &str {
    context
        .split("\n</recent-messages>")
        .next()
        .and_then(|block| block.lines().last())
        .unwrap()
}

#[tokio::test]
async fn overlapping_turns_each_see_their_own_message_last() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let channel = MockChannel::default().with_typing_delay(Duration::from_millis(50));
    let h = harness_with_channel(&config, MockGenerator::default(), channel);

    let agent = Arc::clone(&h.agent);
    let first = tokio::spawn(async move {
        agent
            .process_message(message("m1", "c1", ALICE, "scribble, what is two plus two"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = h
        .agent
        .process_message(message("m2", "c1", BOB, "scribble, and three plus three"))
        .await;

    assert!(matches!(first.await.unwrap(), TurnOutcome::Replied { .. }));
    assert!(matches!(second, TurnOutcome::Replied { .. }));

    let mut last_lines: Vec<String> = h
        .generator
        .requests
        .lock()
        .unwrap()
        .iter()
        .map(|r| last_recent_message(&r.context).to_string())
        .collect();
    last_lines.sort();
    assert_eq!(
        last_lines,
        vec![
            "alice (1): scribble, what is two plus two".to_string(),
            "bob (2): scribble, and three plus three".to_string(),
        ]
    );
}

#[tokio::test]
async fn channel_deleted_during_generation_discards_the_result() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let (generator, started, release) = MockGenerator::default().held();
    let h = harness(&config, generator);

    let agent = Arc::clone(&h.agent);
    let turn = tokio::spawn(async move {
        agent
            .process_message(message("m1", "c1", ALICE, "scribble?"))
            .await
    });

    started.notified().await;
    h.agent
        .handle_event(ChannelEvent::ChannelDeleted {
            channel_id: "c1".to_string(),
        })
        .await;
    release.notify_one();

    assert_eq!(turn.await.unwrap(), TurnOutcome::Superseded);
    assert!(h.channel.sent().is_empty());
    assert!(h.agent.history().window("c1", 10).is_empty());
}

#[tokio::test]
async fn generation_failure_sends_fallback_without_learning() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(
        &config,
        MockGenerator::scripted([Scripted::Fail("backend down".to_string())]),
    );

    let outcome = h
        .agent
        .process_message(message("m1", "c1", ALICE, "scribble, hi"))
        .await;

    assert_eq!(outcome, TurnOutcome::Fallback);
    assert_eq!(h.channel.sent_texts(), vec!["oops, my quill slipped".to_string()]);
    assert!(h.agent.memories().is_empty().await);
    assert!(h.agent.dossiers().is_empty().await);
}

#[tokio::test]
async fn generation_timeout_sends_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.generation.timeout = Duration::from_millis(50);
    let h = harness(
        &config,
        MockGenerator::scripted([Scripted::Slow(
            Duration::from_secs(5),
            r#"{"message": "too late"}"#.to_string(),
        )]),
    );

    let outcome = h
        .agent
        .process_message(message("m1", "c1", ALICE, "scribble, hi"))
        .await;

    assert_eq!(outcome, TurnOutcome::Fallback);
    assert_eq!(h.channel.sent_texts(), vec!["oops, my quill slipped".to_string()]);
}

#[tokio::test]
async fn admin_commands_are_admin_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(&config, MockGenerator::default());

    let outcome = h
        .agent
        .process_message(message("m1", "c1", ALICE, "!scribble wake off"))
        .await;
    assert_eq!(outcome, TurnOutcome::Admin);
    assert!(h.channel.sent().is_empty());
    assert!(h.agent.wake().enabled());

    h.agent
        .process_message(message("m2", "c1", ADMIN, "!scribble status"))
        .await;
    let status = h.channel.sent_texts().pop().unwrap();
    assert!(status.contains("wake-word mode: on (10 min window)"));
    assert!(status.contains("memories: 0"));
    assert_eq!(h.generator.request_count(), 0);
}

#[tokio::test]
async fn sleep_closes_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(&config, MockGenerator::default());

    let first = h
        .agent
        .process_message(message("m1", "c1", ALICE, "hey scribble"))
        .await;
    assert!(matches!(first, TurnOutcome::Replied { .. }));

    let follow_up = h
        .agent
        .process_message(message("m2", "c1", ALICE, "what is up"))
        .await;
    assert!(matches!(
        follow_up,
        TurnOutcome::Replied {
            decision: Decision::RespondWakeContinuation,
            ..
        }
    ));

    h.agent
        .process_message(message("m3", "c1", ADMIN, "!scribble sleep"))
        .await;
    let after = h
        .agent
        .process_message(message("m4", "c1", ALICE, "still there?"))
        .await;
    assert!(matches!(after, TurnOutcome::Ignored(_)));
}

#[tokio::test]
async fn wake_mode_off_only_answers_direct_mentions() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(&config, MockGenerator::default());

    h.agent
        .process_message(message("m1", "c1", ADMIN, "!scribble wake off"))
        .await;
    assert!(!h.agent.wake().enabled());

    let mention = h
        .agent
        .process_message(message("m2", "c1", ALICE, "scribble?"))
        .await;
    assert!(matches!(
        mention,
        TurnOutcome::Replied {
            decision: Decision::RespondMentioned,
            ..
        }
    ));

    let follow_up = h
        .agent
        .process_message(message("m3", "c1", ALICE, "and another thing"))
        .await;
    assert!(matches!(follow_up, TurnOutcome::Ignored(_)));
}

#[tokio::test]
async fn memory_repair_command_reports_clean_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let h = harness(
        &config,
        MockGenerator::raw(&[r#"{"message": "noted", "memories": ["the server has a cat"]}"#]),
    );

    h.agent
        .process_message(message("m1", "c1", ALICE, "scribble remember the cat"))
        .await;
    h.agent
        .process_message(message("m2", "c1", ADMIN, "!scribble memory repair"))
        .await;
    assert_eq!(
        h.channel.sent_texts().pop().unwrap(),
        "memory: no problems found"
    );

    h.agent
        .process_message(message("m3", "c1", ADMIN, "!scribble memory reset"))
        .await;
    assert!(h.agent.memories().is_empty().await);
}
