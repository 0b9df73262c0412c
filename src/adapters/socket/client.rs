//! Client side of the socket protocol, used by the CLI and tests.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::protocol::{WireRequest, WireResponse};
use crate::domain::models::names;

/// A connection to a running daemon.
pub struct SocketClient {
    lines: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    /// Pushed events that arrived while waiting for a response.
    pending: VecDeque<WireResponse>,
}

impl SocketClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect to daemon at {}", path.display()))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            lines: FramedRead::new(read, LinesCodec::new()),
            writer: FramedWrite::new(write, LinesCodec::new()),
            pending: VecDeque::new(),
        })
    }

    /// Write one raw line.
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer
            .send(line)
            .await
            .context("failed to write to daemon")
    }

    pub async fn send(&mut self, request: &WireRequest) -> Result<()> {
        let line = serde_json::to_string(request)?;
        self.send_raw(&line).await
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, event: &str, data: Value) -> Result<WireResponse> {
        self.send(&WireRequest::new(event, data)).await?;
        loop {
            let message = self
                .read_line()
                .await?
                .ok_or_else(|| anyhow!("daemon closed the connection"))?;
            if message.push {
                self.pending.push_back(message);
            } else {
                return Ok(message);
            }
        }
    }

    /// Subscribe this connection to router events matching `patterns`.
    pub async fn subscribe(&mut self, patterns: &[String]) -> Result<WireResponse> {
        let response = self
            .request(names::SYSTEM_SUBSCRIBE, json!({"patterns": patterns}))
            .await?;
        if let Some(err) = &response.error {
            return Err(anyhow!("subscribe failed: {}", err.message));
        }
        Ok(response)
    }

    /// Next message of any kind; `None` once the daemon closes the connection.
    pub async fn next_message(&mut self) -> Result<Option<WireResponse>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        self.read_line().await
    }

    async fn read_line(&mut self) -> Result<Option<WireResponse>> {
        match self.lines.next().await {
            None => Ok(None),
            Some(line) => {
                let line = line.context("failed to read from daemon")?;
                let message = serde_json::from_str(&line)
                    .with_context(|| format!("daemon sent an unreadable line: {line}"))?;
                Ok(Some(message))
            }
        }
    }
}
