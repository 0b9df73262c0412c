//! Unix socket server.
//!
//! One task per connection. Requests on a connection are handled one after
//! another, so responses come back in request order. Every client event is
//! dispatched with the `external` origin. `system:subscribe` additionally
//! forwards matching router events to the connection until it closes.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::protocol::{WireRequest, WireResponse};
use crate::domain::errors::DomainError;
use crate::domain::models::{names, DaemonConfig, Event, EventContext};
use crate::services::event_router::{EventPattern, EventRouter};

type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Router events forwarded to a subscribed connection.
struct Subscription {
    receiver: broadcast::Receiver<Arc<Event>>,
    patterns: Vec<EventPattern>,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    #[serde(default = "default_patterns")]
    patterns: Vec<String>,
}

fn default_patterns() -> Vec<String> {
    vec!["*".to_string()]
}

/// Newline-delimited JSON server over a Unix domain socket.
pub struct SocketServer {
    path: PathBuf,
    router: Arc<EventRouter>,
    max_line_bytes: usize,
    shutdown: CancellationToken,
    next_client: AtomicU64,
}

impl SocketServer {
    pub fn new(config: &DaemonConfig, router: Arc<EventRouter>) -> Self {
        Self {
            path: PathBuf::from(&config.socket_path),
            router,
            max_line_bytes: config.max_line_bytes,
            shutdown: CancellationToken::new(),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the socket, replacing a stale socket file left by a dead daemon.
    pub fn bind(&self) -> io::Result<UnixListener> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if self.path.exists() {
            if std::os::unix::net::UnixStream::connect(&self.path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("a daemon is already listening on {}", self.path.display()),
                ));
            }
            debug!(path = %self.path.display(), "removing stale socket");
            std::fs::remove_file(&self.path)?;
        }
        UnixListener::bind(&self.path)
    }

    /// Bind and serve until the shutdown token is cancelled.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        info!(path = %self.path.display(), "socket server listening");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let client_id = format!("client-{}", self.next_client.fetch_add(1, Ordering::Relaxed));
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.handle_connection(stream, client_id).await });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }
        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "socket file already gone");
        }
        info!("socket server stopped");
    }

    #[instrument(skip(self, stream), fields(client_id = %client_id))]
    async fn handle_connection(self: Arc<Self>, stream: UnixStream, client_id: String) {
        debug!("client connected");
        let (read, write) = stream.into_split();
        let mut lines = FramedRead::new(read, LinesCodec::new_with_max_length(self.max_line_bytes));
        let mut writer = FramedWrite::new(write, LinesCodec::new());
        let mut subscription: Option<Subscription> = None;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                frame = lines.next() => match frame {
                    None => break,
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let response = self.handle_line(&line, &client_id, &mut subscription).await;
                        if send(&mut writer, &response).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let err = DomainError::ValidationFailed(format!(
                            "request line exceeds {} bytes",
                            self.max_line_bytes
                        ));
                        // The codec cannot resync after an oversized line.
                        let _ = send(&mut writer, &WireResponse::error("system:error", &err)).await;
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        debug!(error = %e, "connection read failed");
                        break;
                    }
                },
                pushed = next_pushed(&mut subscription) => {
                    if let Some(response) = pushed {
                        if send(&mut writer, &response).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("client disconnected");
    }

    async fn handle_line(
        &self,
        line: &str,
        client_id: &str,
        subscription: &mut Option<Subscription>,
    ) -> WireResponse {
        let request = match WireRequest::decode(line) {
            Ok(request) => request,
            Err(e) => return WireResponse::error(event_hint(line), &e),
        };

        let mut context = EventContext::external().with_client(client_id);
        if let Some(id) = request.correlation_id {
            context = context.with_correlation_id(id);
        }

        if request.event == names::SYSTEM_SUBSCRIBE {
            return self.subscribe(request, context, subscription).await;
        }

        match self.router.dispatch(&request.event, request.data, context).await {
            Ok(outcome) => WireResponse::ok(request.event, outcome.result, outcome.correlation_id),
            Err(e) => WireResponse::error(request.event, &e),
        }
    }

    async fn subscribe(
        &self,
        request: WireRequest,
        context: EventContext,
        subscription: &mut Option<Subscription>,
    ) -> WireResponse {
        let params = match params_or_default(&request.data) {
            Ok(params) => params,
            Err(e) => return WireResponse::error(request.event, &e),
        };
        let patterns = match params
            .patterns
            .iter()
            .map(|p| EventPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(patterns) => patterns,
            Err(e) => return WireResponse::error(request.event, &e),
        };

        let dispatched = match self.router.dispatch(&request.event, request.data, context).await {
            Ok(outcome) => outcome,
            Err(e) => return WireResponse::error(request.event, &e),
        };

        // Subscribe after the dispatch so the subscriber does not see its own request.
        *subscription = Some(Subscription {
            receiver: self.router.subscribe(),
            patterns,
        });
        debug!(patterns = ?params.patterns, "connection subscribed");
        WireResponse::ok(
            request.event,
            Some(json!({"subscribed": params.patterns})),
            dispatched.correlation_id,
        )
    }
}

fn params_or_default(data: &Value) -> Result<SubscribeParams, DomainError> {
    if data.is_null() {
        return Ok(SubscribeParams {
            patterns: default_patterns(),
        });
    }
    serde_json::from_value(data.clone())
        .map_err(|e| DomainError::ValidationFailed(format!("system:subscribe: {e}")))
}

/// Event name to echo when a line fails to decode.
fn event_hint(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| v.get("event").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "system:error".to_string())
}

async fn send(writer: &mut LineWriter, response: &WireResponse) -> Result<(), LinesCodecError> {
    let line = match response.encode() {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, event = %response.event, "failed to encode response");
            return Ok(());
        }
    };
    writer.send(line).await
}

/// Next event for a subscribed connection; pending forever when not subscribed.
async fn next_pushed(subscription: &mut Option<Subscription>) -> Option<WireResponse> {
    let Some(sub) = subscription.as_mut() else {
        return futures::future::pending().await;
    };
    loop {
        match sub.receiver.recv().await {
            Ok(event) => {
                if sub.patterns.iter().any(|p| p.matches(&event.name)) {
                    return Some(WireResponse::pushed(&event));
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "subscriber fell behind");
                let err = DomainError::Internal(format!("subscriber lagged, {skipped} events dropped"));
                return Some(WireResponse::error(names::SYSTEM_SUBSCRIBE, &err));
            }
            Err(RecvError::Closed) => {
                *subscription = None;
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::socket::client::SocketClient;
    use crate::domain::models::{RouterConfig, TracerConfig};
    use crate::services::correlation_tracer::CorrelationTracer;
    use crate::services::event_router::{EventHandler, HandlerMode};
    use crate::domain::errors::DomainResult;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl EventHandler for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
            if event.str_field("fail").is_some() {
                return Err(DomainError::ValidationFailed("asked to fail".into()));
            }
            Ok(Some(json!({"echo": event.data, "origin": event.origin()})))
        }
    }

    async fn start(dir: &tempfile::TempDir, max_line_bytes: usize) -> (Arc<SocketServer>, Arc<EventRouter>) {
        let tracer = Arc::new(CorrelationTracer::new(&TracerConfig::default()).unwrap());
        let router = Arc::new(EventRouter::new(tracer, &RouterConfig::default()));
        router
            .register("test:echo", Arc::new(Echo), 0, HandlerMode::Primary)
            .await
            .unwrap();
        let config = DaemonConfig {
            socket_path: dir.path().join("s.sock").display().to_string(),
            max_line_bytes,
        };
        let server = Arc::new(SocketServer::new(&config, router.clone()));
        let listener = server.bind().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, router)
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _router) = start(&dir, 4096).await;
        let mut client = SocketClient::connect(server.path()).await.unwrap();

        let response = client.request("test:echo", json!({"x": 1})).await.unwrap();
        assert_eq!(response.event, "test:echo");
        let data = response.data.unwrap();
        assert_eq!(data["echo"]["x"], 1);
        assert_eq!(data["origin"], "external");
        assert!(response.correlation_id.is_some());

        let response = client.request("test:echo", json!({"fail": "yes"})).await.unwrap();
        assert_eq!(response.error.unwrap().kind, "validation_error");

        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error_and_connection_survives() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _router) = start(&dir, 4096).await;
        let mut client = SocketClient::connect(server.path()).await.unwrap();

        client.send_raw("{not json").await.unwrap();
        let response = client.next_message().await.unwrap().unwrap();
        assert_eq!(response.event, "system:error");
        assert!(response.is_error());

        let response = client.request("test:echo", json!({})).await.unwrap();
        assert!(!response.is_error());
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _router) = start(&dir, 64).await;
        let mut client = SocketClient::connect(server.path()).await.unwrap();

        let big = "x".repeat(200);
        client
            .send_raw(&json!({"event": "test:echo", "data": {"big": big}}).to_string())
            .await
            .unwrap();
        let response = client.next_message().await.unwrap().unwrap();
        assert_eq!(response.error.unwrap().kind, "validation_error");
        assert!(client.next_message().await.unwrap().is_none());
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_events() {
        let dir = tempfile::tempdir().unwrap();
        let (server, router) = start(&dir, 4096).await;
        let mut watcher = SocketClient::connect(server.path()).await.unwrap();
        let ack = watcher.subscribe(&["test:*".to_string()]).await.unwrap();
        assert_eq!(ack.data.unwrap()["subscribed"], json!(["test:*"]));

        router.emit("other:thing", json!({}), EventContext::internal(None)).await;
        router.emit("test:ping", json!({"n": 7}), EventContext::internal(None)).await;

        let pushed = tokio::time::timeout(Duration::from_secs(2), watcher.next_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(pushed.push);
        assert_eq!(pushed.event, "test:ping");
        assert_eq!(pushed.data.unwrap()["data"]["n"], 7);
        server.shutdown_token().cancel();
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_shutdown_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        std::fs::write(&path, b"stale").unwrap();

        let (server, _router) = start(&dir, 4096).await;
        assert!(SocketClient::connect(server.path()).await.is_ok());

        server.shutdown_token().cancel();
        for _ in 0..50 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());
    }
}
