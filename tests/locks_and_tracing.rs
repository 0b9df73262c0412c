//! Conversation locks and correlation tracing through the router.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use switchyard::adapters::providers::{MockProvider, MockResponse};
use switchyard::domain::models::{CorrelationId, EventContext};

use common::{daemon_with, next_event, send, terminal_event, test_config};

#[tokio::test]
async fn test_second_acquire_reports_holder() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::new());
    let daemon = daemon_with(test_config(&dir), &mock).await;

    let first = send(&daemon, "conversation:acquire_lock", json!({"conversation_id": "c1", "request_id": "A"})).await;
    assert_eq!(first["acquired"], true);

    let second = send(&daemon, "conversation:acquire_lock", json!({"conversation_id": "c1", "request_id": "B"})).await;
    assert_eq!(second["acquired"], false);
    assert_eq!(second["holder"], "A");

    let status = send(&daemon, "conversation:lock_status", json!({"conversation_id": "c1"})).await;
    assert_eq!(status["holder"], "A");

    send(&daemon, "conversation:release_lock", json!({"request_id": "A"})).await;
    let third = send(&daemon, "conversation:acquire_lock", json!({"conversation_id": "c1", "request_id": "B"})).await;
    assert_eq!(third["acquired"], true);
}

#[tokio::test]
async fn test_request_parks_on_held_conversation_until_release() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::new());
    let daemon = daemon_with(test_config(&dir), &mock).await;
    let mut events = daemon.router().subscribe();

    send(&daemon, "conversation:acquire_lock", json!({"conversation_id": "c1", "request_id": "manual"})).await;
    let reply = send(&daemon, "completion:async", json!({"prompt": "p", "conversation_id": "c1"})).await;
    let request_id = reply["request_id"].as_str().unwrap().to_string();
    assert_eq!(reply["status"], "queued");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.invocation_count(), 0);

    send(&daemon, "conversation:release_lock", json!({"request_id": "manual"})).await;
    let outcome = terminal_event(&mut events, &request_id).await;
    assert_eq!(outcome.name, "completion:result");
    assert_eq!(mock.invocations()[0].conversation_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_internal_events_are_children_of_the_submission() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::new());
    let daemon = daemon_with(test_config(&dir), &mock).await;
    let mut events = daemon.router().subscribe();

    let submitted = daemon
        .router()
        .dispatch("completion:async", json!({"prompt": "hello"}), EventContext::external())
        .await
        .unwrap();
    let root = submitted.correlation_id;
    let dispatched = next_event(&mut events, "completion:dispatched", |e| {
        e.context.parent_correlation_id == Some(root)
    })
    .await;

    let tracer = daemon.router().tracer();
    let chain: Vec<CorrelationId> = tracer
        .chain(dispatched.correlation_id)
        .unwrap()
        .iter()
        .map(|n| n.correlation_id)
        .collect();
    assert_eq!(chain, vec![root, dispatched.correlation_id]);

    let reply = send(&daemon, "correlation:chain", json!({"correlation_id": dispatched.correlation_id})).await;
    assert_eq!(reply["chain"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_trace_graph_is_acyclic_and_time_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.injection.max_chain_depth = 2;
    let mock = Arc::new(MockProvider::with_default_response(
        MockResponse::success("next step").with_delay(Duration::from_millis(5)),
    ));
    let daemon = daemon_with(config, &mock).await;
    let mut log = daemon.router().subscribe();
    let mut events = daemon.router().subscribe();

    send(
        &daemon,
        "completion:async",
        json!({"prompt": "go", "session_id": "s1", "injection": {"mode": "immediate"}}),
    )
    .await;
    send(&daemon, "completion:async", json!({"prompt": "other", "session_id": "s2"})).await;
    next_event(&mut events, "injection:circuit_breaker_tripped", |_| true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let tracer = daemon.router().tracer();
    let mut checked = 0;
    while let Ok(event) = log.try_recv() {
        let chain = tracer.chain(event.correlation_id).unwrap();
        let ids: HashSet<_> = chain.iter().map(|n| n.correlation_id).collect();
        assert_eq!(ids.len(), chain.len(), "no node is its own ancestor");
        assert_eq!(chain.last().unwrap().correlation_id, event.correlation_id);
        assert!(chain[0].parent_id.is_none());
        for pair in chain.windows(2) {
            assert_eq!(pair[1].parent_id, Some(pair[0].correlation_id));
            assert!(pair[1].started_at >= pair[0].started_at);
        }
        checked += 1;
    }
    assert!(checked > 10);
}

#[tokio::test]
async fn test_long_call_keeps_conversation_lock_alive() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.locks.ttl_ms = 100;
    let mock = Arc::new(MockProvider::with_default_response(
        MockResponse::success("done").with_delay(Duration::from_millis(600)),
    ));
    let daemon = daemon_with(config, &mock).await;
    let mut events = daemon.router().subscribe();

    let first = send(&daemon, "completion:async", json!({"prompt": "first", "session_id": "s1", "conversation_id": "c1"})).await;
    let second = send(&daemon, "completion:async", json!({"prompt": "second", "session_id": "s2", "conversation_id": "c1"})).await;

    // Well past the TTL, the holder is still inside its provider call.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(daemon.locks().sweep_expired().await.is_empty());
    let status = send(&daemon, "conversation:lock_status", json!({"conversation_id": "c1"})).await;
    assert_eq!(status["holder"], first["request_id"]);
    assert_eq!(mock.invocation_count(), 1);

    let a = terminal_event(&mut events, first["request_id"].as_str().unwrap()).await;
    let b = terminal_event(&mut events, second["request_id"].as_str().unwrap()).await;
    assert_eq!(a.name, "completion:result");
    assert_eq!(b.name, "completion:result");
    assert_eq!(mock.max_concurrent(), 1);
}

#[tokio::test]
async fn test_divergent_rotation_reports_fork() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::new());
    mock.set_response_for_prompt("first", MockResponse::success("one").rotating_to("c2"));
    mock.set_response_for_prompt("second", MockResponse::success("two").rotating_to("c3"));
    let daemon = daemon_with(test_config(&dir), &mock).await;
    let mut events = daemon.router().subscribe();

    let first = send(&daemon, "completion:async", json!({"prompt": "first", "session_id": "s1", "conversation_id": "c1"})).await;
    let second = send(&daemon, "completion:async", json!({"prompt": "second", "session_id": "s2", "conversation_id": "c1"})).await;

    let fork = next_event(&mut events, "conversation:fork_detected", |_| true).await;
    assert_eq!(fork.data["conversation_id"], "c1");
    assert_eq!(fork.data["existing_branch"], "c2");
    assert_eq!(fork.data["new_branch"], "c3");
    assert_eq!(fork.data["existing_request_id"], first["request_id"]);
    assert_eq!(fork.data["request_id"], second["request_id"]);
    assert_eq!(fork.data["error"]["kind"], "fork_detected");

    let outcome = terminal_event(&mut events, second["request_id"].as_str().unwrap()).await;
    assert_eq!(outcome.name, "completion:result");
    assert_eq!(outcome.data["conversation_id"], "c3");
    assert_eq!(mock.max_concurrent(), 1);
}

#[tokio::test]
async fn test_stale_lock_sweep_wakes_parked_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.locks.ttl_ms = 100;
    let mock = Arc::new(MockProvider::new());
    let daemon = daemon_with(config, &mock).await;
    let mut events = daemon.router().subscribe();

    send(&daemon, "conversation:acquire_lock", json!({"conversation_id": "c1", "request_id": "abandoned"})).await;
    let reply = send(&daemon, "completion:async", json!({"prompt": "p", "conversation_id": "c1"})).await;
    let request_id = reply["request_id"].as_str().unwrap().to_string();
    assert_eq!(reply["status"], "queued");

    // The manual holder never renews.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.invocation_count(), 0);
    let swept = daemon.locks().sweep_expired().await;
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].holder.to_string(), "abandoned");

    let stale = next_event(&mut events, "conversation:stale_lock_released", |_| true).await;
    assert_eq!(stale.data["request_id"], "abandoned");
    let outcome = terminal_event(&mut events, &request_id).await;
    assert_eq!(outcome.name, "completion:result");
    assert_eq!(mock.invocations()[0].conversation_id.as_deref(), Some("c1"));
}
