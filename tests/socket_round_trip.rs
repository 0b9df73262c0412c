//! Clients talking to a running daemon over its Unix socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use switchyard::adapters::providers::{MockProvider, MockResponse};
use switchyard::adapters::socket::{SocketClient, WireResponse};
use switchyard::domain::models::CorrelationId;

use common::{daemon_with, test_config, WAIT};

async fn connect(socket: &str) -> SocketClient {
    for _ in 0..200 {
        if let Ok(client) = SocketClient::connect(socket).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("daemon never accepted connections on {socket}");
}

async fn next_pushed(client: &mut SocketClient, event: &str) -> WireResponse {
    tokio::time::timeout(WAIT, async {
        loop {
            let message = client.next_message().await.unwrap().expect("connection closed");
            if message.push && message.event == event {
                return message;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {event} pushed"))
}

#[tokio::test]
async fn test_async_completion_over_socket() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let socket = config.daemon.socket_path.clone();
    let mock = Arc::new(MockProvider::with_default_response(
        MockResponse::success("from the socket").with_delay(Duration::from_millis(20)),
    ));
    let daemon = daemon_with(config, &mock).await;
    let token = daemon.shutdown_token();
    let task = tokio::spawn(daemon.run());

    let mut watcher = connect(&socket).await;
    watcher.subscribe(&["completion:*".to_string()]).await.unwrap();

    let mut client = connect(&socket).await;
    let reply = client
        .request("completion:async", json!({"prompt": "hi", "session_id": "s1"}))
        .await
        .unwrap();
    assert!(!reply.is_error());
    let data = reply.data.unwrap();
    let request_id = data["request_id"].as_str().unwrap().to_string();

    let result = next_pushed(&mut watcher, "completion:result").await;
    let event = result.data.unwrap();
    assert_eq!(event["data"]["request_id"], request_id.as_str());
    assert_eq!(event["data"]["response"], "from the socket");
    assert_eq!(event["origin"], "internal");

    let status = client
        .request("completion:status", json!({"request_id": request_id}))
        .await
        .unwrap();
    assert_eq!(status.data.unwrap()["status"], "completed");

    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_errors_are_reported_per_request() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let socket = config.daemon.socket_path.clone();
    let mock = Arc::new(MockProvider::new());
    let daemon = daemon_with(config, &mock).await;
    let token = daemon.shutdown_token();
    let task = tokio::spawn(daemon.run());

    let mut client = connect(&socket).await;
    let missing_prompt = client.request("completion:async", json!({})).await.unwrap();
    assert!(missing_prompt.is_error());
    assert_eq!(missing_prompt.error.unwrap().kind, "validation_error");

    let unknown = client
        .request("correlation:chain", json!({"correlation_id": CorrelationId::new()}))
        .await
        .unwrap();
    assert_eq!(unknown.error.unwrap().kind, "not_found");

    // The connection is still usable.
    let health = client.request("system:health", json!({})).await.unwrap();
    assert_eq!(health.data.unwrap()["status"], "ok");
    assert_eq!(mock.invocation_count(), 0);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
}
