//! Injection chains: results fed back as new requests, bounded by the breaker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use switchyard::adapters::providers::{MockProvider, MockResponse};
use switchyard::domain::models::EventOrigin;

use common::{daemon_with, next_event, send, test_config, wait_for};

#[tokio::test]
async fn test_chain_stops_at_breaker_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.injection.max_chain_depth = 3;
    let mock = Arc::new(MockProvider::with_default_response(MockResponse::success("keep going")));
    let daemon = daemon_with(config, &mock).await;
    let mut events = daemon.router().subscribe();
    let mut submissions = daemon.router().subscribe();

    send(
        &daemon,
        "completion:async",
        json!({"prompt": "start", "session_id": "s1", "injection": {"mode": "immediate"}}),
    )
    .await;

    let tripped = next_event(&mut events, "injection:circuit_breaker_tripped", |_| true).await;
    assert_eq!(tripped.data["chain_root"], "s1");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The first request plus injections 1-3; the fourth never reached the provider.
    assert_eq!(mock.invocation_count(), 4);
    let mut depths = Vec::new();
    while let Ok(event) = submissions.try_recv() {
        if event.name == "completion:async" && event.origin() == EventOrigin::Injection {
            depths.push(event.data["chain_depth"].as_u64().unwrap());
        }
    }
    assert_eq!(depths, vec![1, 2, 3]);

    let status = send(&daemon, "injection:status", json!({})).await;
    let breakers = status["circuit_breakers"].as_array().unwrap();
    let s1 = breakers.iter().find(|b| b["chain_root"] == "s1").unwrap();
    assert_eq!(s1["state"], "open");
    assert_eq!(s1["trip_count"], 1);
}

#[tokio::test]
async fn test_external_input_resets_chain() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.injection.max_chain_depth = 1;
    let mock = Arc::new(MockProvider::with_default_response(MockResponse::success("again")));
    let daemon = daemon_with(config, &mock).await;
    let mut events = daemon.router().subscribe();

    let request = json!({"prompt": "start", "session_id": "s1", "injection": {"mode": "immediate"}});
    send(&daemon, "completion:async", request.clone()).await;
    next_event(&mut events, "injection:circuit_breaker_tripped", |_| true).await;
    let after_first_chain = mock.invocation_count();
    assert_eq!(after_first_chain, 2);

    // A new external submission closes the breaker and the chain may run again.
    send(&daemon, "completion:async", request).await;
    next_event(&mut events, "injection:circuit_breaker_tripped", |_| true).await;
    assert!(wait_for(|| mock.invocation_count() == after_first_chain + 2).await);
}

#[tokio::test]
async fn test_result_can_opt_out_of_injection() {
    let dir = tempfile::tempdir().unwrap();
    let mock = Arc::new(MockProvider::with_default_response(MockResponse::success(
        json!({"text": "done", "inject": false}),
    )));
    let daemon = daemon_with(test_config(&dir), &mock).await;
    let mut events = daemon.router().subscribe();

    send(
        &daemon,
        "completion:async",
        json!({"prompt": "start", "session_id": "s1", "injection": {"mode": "immediate"}}),
    )
    .await;
    next_event(&mut events, "completion:result", |_| true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.invocation_count(), 1);
}

#[tokio::test]
async fn test_next_mode_entries_are_merged_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.injection.coalesce_window_ms = 100;
    let mock = Arc::new(MockProvider::new());
    let daemon = daemon_with(config, &mock).await;
    let mut events = daemon.router().subscribe();

    let batch = json!({"entries": [
        {"content": "one", "target_session_id": "s9", "mode": "next"},
        {"content": "two", "target_session_id": "s9", "mode": "next"},
    ]});
    send(&daemon, "injection:batch", batch).await;
    let listed = send(&daemon, "injection:list", json!({"target_session_id": "s9"})).await;
    assert_eq!(listed["entries"].as_array().map(Vec::len), Some(2));

    next_event(&mut events, "injection:submitted", |_| true).await;
    assert!(wait_for(|| mock.invocation_count() == 1).await);
    assert_eq!(mock.invocations()[0].prompt, json!("one\n\ntwo"));
}
