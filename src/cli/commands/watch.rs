//! `switchyard watch`: stream events from a running daemon.

use std::path::Path;

use anyhow::{bail, Result};
use clap::Args;
use serde_json::Value;

use crate::adapters::socket::{SocketClient, WireResponse};
use crate::cli::load_config;
use crate::cli::output::cell_text;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Event patterns such as `completion:*` (default: every event)
    pub patterns: Vec<String>,

    /// Socket path (overrides daemon.socket_path)
    #[arg(short, long)]
    pub socket: Option<String>,

    /// Exit after this many events
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

fn format_line(message: &WireResponse) -> String {
    let wire = message.data.as_ref().unwrap_or(&Value::Null);
    let timestamp = wire.get("timestamp").and_then(Value::as_str).unwrap_or("-");
    let origin = wire.get("origin").and_then(Value::as_str).unwrap_or("-");
    let correlation = message
        .correlation_id
        .map(|id| id.to_string().chars().take(8).collect::<String>())
        .unwrap_or_else(|| "-".to_string());
    let data = wire.get("data").unwrap_or(&Value::Null);
    format!(
        "{timestamp} {:<36} {correlation} {origin:<9} {}",
        message.event,
        cell_text(data, 120)
    )
}

pub async fn execute(args: WatchArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let socket = args.socket.unwrap_or(config.daemon.socket_path);
    let patterns = if args.patterns.is_empty() {
        vec!["*".to_string()]
    } else {
        args.patterns
    };

    let mut client = SocketClient::connect(&socket).await?;
    client.subscribe(&patterns).await?;
    if !json_mode {
        eprintln!("watching {} on {socket} (ctrl-c to stop)", patterns.join(", "));
    }

    let mut seen = 0usize;
    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            message = client.next_message() => message?,
        };
        let Some(message) = message else {
            bail!("daemon closed the connection");
        };
        if let Some(err) = &message.error {
            eprintln!("warning: {} ({})", err.message, err.kind);
            continue;
        }
        if json_mode {
            println!("{}", message.data.as_ref().unwrap_or(&Value::Null));
        } else {
            println!("{}", format_line(&message));
        }
        seen += 1;
        if args.count.is_some_and(|n| seen >= n) {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::CorrelationId;
    use serde_json::json;

    #[test]
    fn test_format_line() {
        let id = CorrelationId::new();
        let message = WireResponse {
            event: "completion:result".into(),
            data: Some(json!({
                "event": "completion:result",
                "data": {"request_id": "r1"},
                "origin": "internal",
                "timestamp": "2026-01-01T00:00:00Z",
            })),
            correlation_id: Some(id),
            error: None,
            push: true,
        };
        let line = format_line(&message);
        assert!(line.starts_with("2026-01-01T00:00:00Z completion:result"));
        assert!(line.contains(&id.to_string()[..8]));
        assert!(line.contains("internal"));
        assert!(line.contains(r#"{"request_id":"r1"}"#));
    }
}
