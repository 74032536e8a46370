mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use benebot::agent::TurnOutcome;
use benebot::capabilities::CapabilityRegistry;
use benebot::comm::InboundMessage;
use benebot::models::{ModelResponse, ResponsePart};
use benebot::session::{ConversationStore, FunctionCall, Part, Role};
use common::*;
use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

fn ip_call() -> ModelResponse {
    ModelResponse::function_call("get_my_ip", Map::new())
}

#[tokio::test]
async fn end_to_end_ip_question() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(ScriptedProvider::ok(vec![
        ip_call(),
        ModelResponse::text("Your IP is 203.0.113.5"),
    ]));
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        provider.clone(),
        ip_registry(invocations.clone()),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let msg = mention(42, 7, sender(1, "Ana"), "what's my IP?");
    let report = agent.run_turn(&msg, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, TurnOutcome::Replied);
    assert_eq!(report.model_calls, 2);
    assert_eq!(report.replies_sent, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("203.0.113.5"));
    assert!(sink.events().contains(&SinkEvent::Sent {
        chat_id: 42,
        text: "Your IP is 203.0.113.5".into(),
        reply_to: Some(7),
    }));

    let history = store.get(42).history;
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].role(), Role::User);
    assert_eq!(history[0].text(), "[Ana] @bene_bot what's my IP?");
    assert!(history[1].has_function_calls());
    assert!(history[2].is_function_results());
    assert_eq!(history[3].role(), Role::Model);
    assert_eq!(history[3].text(), "Your IP is 203.0.113.5");

    match &history[2].parts()[0] {
        Part::FunctionResponse(r) => {
            assert_eq!(r.name, "get_my_ip");
            assert_eq!(r.response.get("ip"), Some(&json!("203.0.113.5")));
        }
        other => panic!("expected function response, got {other:?}"),
    }
}

#[tokio::test]
async fn n_capability_rounds_then_text() {
    for n in 0..4usize {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut script: Vec<ModelResponse> = (0..n).map(|_| ip_call()).collect();
        script.push(ModelResponse::text("done"));
        let store = Arc::new(ConversationStore::new(100));
        let sink = Arc::new(RecordingSink::new());
        let agent = agent_with(
            Arc::new(ScriptedProvider::ok(script)),
            ip_registry(invocations.clone()),
            store.clone(),
            sink.clone(),
            settings(8),
        );

        let msg = mention(1, 1, sender(1, "Ana"), "go");
        let report = agent.run_turn(&msg, &CancellationToken::new()).await.unwrap();

        assert_eq!(report.outcome, TurnOutcome::Replied);
        assert_eq!(invocations.load(Ordering::SeqCst), n);
        assert_eq!(report.tool_calls.len(), n);
        assert_eq!(sink.sent(), vec!["done".to_string()]);
        assert_eq!(store.get(1).history.len(), 1 + 2 * n + 1);
    }
}

#[tokio::test]
async fn history_is_carried_into_the_next_turn() {
    let provider = Arc::new(ScriptedProvider::ok(vec![
        ModelResponse::text("oi Ana"),
        ModelResponse::text("tudo bem"),
    ]));
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        provider.clone(),
        CapabilityRegistry::new(),
        store.clone(),
        sink.clone(),
        settings(8),
    );
    let cancel = CancellationToken::new();

    agent
        .run_turn(&mention(5, 1, sender(1, "Ana"), "oi"), &cancel)
        .await
        .unwrap();
    agent
        .run_turn(&mention(5, 2, sender(2, "Bia"), "e aí"), &cancel)
        .await
        .unwrap();

    let seen = provider.seen.lock().unwrap().clone();
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[1].len(), 3);
    assert_eq!(seen[1][2].text(), "[Bia] @bene_bot e aí");
    assert_eq!(store.get(5).history.len(), 4);
}

#[tokio::test]
async fn model_failure_replies_with_error_and_keeps_history() {
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        Arc::new(ScriptedProvider::new(vec![Err("upstream exploded".into())])),
        CapabilityRegistry::new(),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let msg = mention(9, 3, sender(1, "Ana"), "hello");
    let report = agent.run_turn(&msg, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, TurnOutcome::ModelFailed);
    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("Erro: "));
    assert!(sent[0].contains("upstream exploded"));
    assert!(!store.contains(9));
}

#[tokio::test]
async fn failure_mid_loop_discards_partial_turn() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        Arc::new(ScriptedProvider::new(vec![
            Ok(ip_call()),
            Err("quota exceeded".into()),
        ])),
        ip_registry(invocations.clone()),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let report = agent
        .run_turn(&mention(3, 1, sender(1, "Ana"), "ip?"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::ModelFailed);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(store.get(3).history.is_empty());
}

#[tokio::test]
async fn step_limit_stops_endless_calls() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let script: Vec<ModelResponse> = (0..10).map(|_| ip_call()).collect();
    let provider = Arc::new(ScriptedProvider::ok(script));
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        provider.clone(),
        ip_registry(invocations.clone()),
        store.clone(),
        sink.clone(),
        settings(2),
    );

    let report = agent
        .run_turn(&mention(4, 1, sender(1, "Ana"), "loop"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::StepLimit);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(provider.call_count(), 3);
    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("Erro: "));
    assert!(!store.contains(4));
}

#[tokio::test]
async fn unknown_capability_error_is_fed_back() {
    let provider = Arc::new(ScriptedProvider::ok(vec![
        ModelResponse::function_call("launch_rockets", Map::new()),
        ModelResponse::text("I can't do that"),
    ]));
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        provider.clone(),
        CapabilityRegistry::new(),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let report = agent
        .run_turn(&mention(6, 1, sender(1, "Ana"), "launch"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::Replied);
    assert_eq!(report.tool_calls.len(), 1);
    assert!(!report.tool_calls[0].success);

    // second model request saw the error result
    let seen = provider.seen.lock().unwrap().clone();
    let last = seen[1].last().unwrap();
    match &last.parts()[0] {
        Part::FunctionResponse(r) => {
            let err = r.response.get("error").and_then(|v| v.as_str()).unwrap();
            assert!(err.contains("launch_rockets"));
            assert_eq!(r.response.len(), 1);
        }
        other => panic!("expected function response, got {other:?}"),
    }
    assert_eq!(sink.sent(), vec!["I can't do that".to_string()]);
}

#[tokio::test]
async fn text_across_responses_edits_the_first_reply() {
    let provider = Arc::new(ScriptedProvider::ok(vec![
        ModelResponse::from_parts(vec![
            ResponsePart::Text("Checking…".into()),
            ResponsePart::FunctionCall(FunctionCall {
                name: "get_my_ip".into(),
                args: Map::new(),
            }),
        ]),
        ModelResponse::text("It is 203.0.113.5"),
    ]));
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        provider,
        ip_registry(Arc::new(AtomicUsize::new(0))),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let report = agent
        .run_turn(&mention(8, 1, sender(1, "Ana"), "ip"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.replies_sent, 1);
    assert_eq!(sink.sent(), vec!["Checking…".to_string()]);
    assert_eq!(sink.edits(), vec!["Checking…\n\nIt is 203.0.113.5".to_string()]);
    assert_eq!(store.get(8).history.len(), 4);
}

#[tokio::test]
async fn empty_response_saves_user_turn_without_reply() {
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        Arc::new(ScriptedProvider::ok(vec![ModelResponse::default()])),
        CapabilityRegistry::new(),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let report = agent
        .run_turn(&mention(2, 1, sender(1, "Ana"), "hm"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::NoReply);
    assert!(sink.sent().is_empty());
    assert_eq!(store.get(2).history.len(), 1);
}

#[tokio::test]
async fn typing_failure_does_not_abort_turn() {
    let sink = Arc::new(RecordingSink::failing_typing());
    let agent = agent_with(
        Arc::new(ScriptedProvider::ok(vec![ModelResponse::text("ok")])),
        CapabilityRegistry::new(),
        Arc::new(ConversationStore::new(20)),
        sink.clone(),
        settings(8),
    );

    let report = agent
        .run_turn(&mention(1, 1, sender(1, "Ana"), "hi"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::Replied);
    assert_eq!(sink.typing_count(), 1);
    assert_eq!(sink.sent(), vec!["ok".to_string()]);
}

#[tokio::test]
async fn anonymous_sender_is_labelled() {
    let store = Arc::new(ConversationStore::new(20));
    let agent = agent_with(
        Arc::new(ScriptedProvider::ok(vec![ModelResponse::text("hi")])),
        CapabilityRegistry::new(),
        store.clone(),
        Arc::new(RecordingSink::new()),
        settings(8),
    );

    let msg = InboundMessage::text(11, 1, None, "hello there");
    agent.run_turn(&msg, &CancellationToken::new()).await.unwrap();

    assert_eq!(store.get(11).history[0].text(), "[anonymous] hello there");
}

#[tokio::test]
async fn cancellation_interrupts_model_call() {
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let agent = agent_with(
        Arc::new(StalledProvider),
        CapabilityRegistry::new(),
        store.clone(),
        sink.clone(),
        settings(8),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = agent
        .run_turn(&mention(12, 1, sender(1, "Ana"), "slow"), &cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::Cancelled);
    assert!(sink.sent().is_empty());
    assert!(!store.contains(12));
}

#[tokio::test]
async fn model_timeout_is_reported() {
    let store = Arc::new(ConversationStore::new(20));
    let sink = Arc::new(RecordingSink::new());
    let mut s = settings(8);
    s.request_timeout = Duration::from_millis(50);
    let agent = agent_with(
        Arc::new(StalledProvider),
        CapabilityRegistry::new(),
        store.clone(),
        sink.clone(),
        s,
    );

    let report = agent
        .run_turn(&mention(13, 1, sender(1, "Ana"), "slow"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::ModelFailed);
    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("Erro: "));
    assert!(!store.contains(13));
}

#[tokio::test]
async fn concurrent_turns_in_one_chat_both_persist() {
    let store = Arc::new(ConversationStore::new(20));
    let agent = Arc::new(agent_with(
        Arc::new(ScriptedProvider::ok(vec![
            ModelResponse::text("a"),
            ModelResponse::text("b"),
        ])),
        CapabilityRegistry::new(),
        store.clone(),
        Arc::new(RecordingSink::new()),
        settings(8),
    ));

    let cancel = CancellationToken::new();
    let msg_a = mention(20, 1, sender(1, "Ana"), "one");
    let msg_b = mention(20, 2, sender(2, "Bia"), "two");
    let (a, b) = tokio::join!(
        agent.run_turn(&msg_a, &cancel),
        agent.run_turn(&msg_b, &cancel),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(store.get(20).history.len(), 4);
}
