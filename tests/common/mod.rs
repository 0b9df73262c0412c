//! Common test utilities for integration tests
//!
//! Builds daemons backed by the mock provider and waits on router events.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use switchyard::adapters::providers::MockProvider;
use switchyard::application::Daemon;
use switchyard::domain::models::{Config, Event, EventContext};

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Default configuration with a socket inside `dir`.
pub fn test_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.daemon.socket_path = dir.path().join("switchyard.sock").display().to_string();
    config
}

/// Build a daemon whose completions go to `mock`.
pub async fn daemon_with(config: Config, mock: &Arc<MockProvider>) -> Daemon {
    Daemon::with_provider(config, mock.clone())
        .await
        .expect("daemon should build")
}

/// Dispatch a client event and return the primary result.
pub async fn send(daemon: &Daemon, event: &str, data: Value) -> Value {
    daemon
        .router()
        .dispatch(event, data, EventContext::external())
        .await
        .unwrap_or_else(|e| panic!("{event} failed: {e}"))
        .result
        .unwrap_or(Value::Null)
}

/// Wait for the next event named `name` whose data satisfies `filter`.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<Arc<Event>>, name: &str, filter: F) -> Arc<Event>
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("router channel closed");
            if event.name == name && filter(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Wait for the terminal event of `request_id`.
pub async fn terminal_event(rx: &mut broadcast::Receiver<Arc<Event>>, request_id: &str) -> Arc<Event> {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("router channel closed");
            let terminal = matches!(
                event.name.as_str(),
                "completion:result" | "completion:error" | "completion:cancelled"
            );
            if terminal && event.str_field("request_id") == Some(request_id) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for the outcome of {request_id}"))
}

/// Poll `predicate` every 10ms until it holds or `WAIT` elapses.
pub async fn wait_for<F>(mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// Request status string from `completion:status`.
pub async fn status_of(daemon: &Daemon, request_id: &str) -> String {
    let status = send(daemon, "completion:status", serde_json::json!({"request_id": request_id})).await;
    status["status"].as_str().unwrap_or_default().to_string()
}
