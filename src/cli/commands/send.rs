//! `switchyard send`: one request against a running daemon.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;

use crate::adapters::socket::{SocketClient, WireResponse};
use crate::cli::load_config;
use crate::cli::output::{output, value_table, CommandOutput};
use crate::domain::models::names;

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Event name, e.g. completion:async
    pub event: String,

    /// JSON object payload
    #[arg(short, long, default_value = "{}")]
    pub data: String,

    /// Socket path (overrides daemon.socket_path)
    #[arg(short, long)]
    pub socket: Option<String>,

    /// For completion:async, wait for the request's terminal event
    #[arg(short, long)]
    pub wait: bool,

    /// Give up waiting after this many seconds
    #[arg(long, default_value = "600")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct SendOutput {
    pub response: WireResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WireResponse>,
}

impl CommandOutput for SendOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![format!("{} ->", self.response.event)];
        if let Some(id) = self.response.correlation_id {
            lines.push(format!("correlation: {id}"));
        }
        lines.push(value_table(self.response.data.as_ref().unwrap_or(&Value::Null)));
        if let Some(outcome) = &self.outcome {
            lines.push(String::new());
            lines.push(format!("{}:", outcome.event));
            let payload = outcome
                .data
                .as_ref()
                .and_then(|d| d.get("data"))
                .unwrap_or(&Value::Null);
            lines.push(value_table(payload));
        }
        lines.join("\n")
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

fn is_terminal_for(message: &WireResponse, request_id: &str) -> bool {
    let terminal = [names::COMPLETION_RESULT, names::COMPLETION_ERROR, names::COMPLETION_CANCELLED];
    message.push
        && terminal.contains(&message.event.as_str())
        && message
            .data
            .as_ref()
            .and_then(|d| d.pointer("/data/request_id"))
            .and_then(Value::as_str)
            == Some(request_id)
}

pub async fn execute(args: SendArgs, config_path: Option<&Path>, json_mode: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let socket = args.socket.unwrap_or(config.daemon.socket_path);
    let data: Value = serde_json::from_str(&args.data).context("--data must be valid JSON")?;
    let wait = args.wait && args.event == names::COMPLETION_ASYNC;

    let mut client = SocketClient::connect(&socket).await?;
    if wait {
        client.subscribe(&["completion:*".to_string()]).await?;
    }

    let response = client.request(&args.event, data).await?;
    if let Some(err) = &response.error {
        bail!("{} ({})", err.message, err.kind);
    }

    let mut outcome = None;
    if wait {
        let request_id = response
            .data
            .as_ref()
            .and_then(|d| d.get("request_id"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("daemon did not return a request_id"))?
            .to_string();
        let wait_for_terminal = async {
            while let Some(message) = client.next_message().await? {
                if is_terminal_for(&message, &request_id) {
                    return Ok(Some(message));
                }
            }
            Ok::<_, anyhow::Error>(None)
        };
        outcome = tokio::time::timeout(Duration::from_secs(args.timeout_secs), wait_for_terminal)
            .await
            .with_context(|| format!("no outcome for {request_id} after {}s", args.timeout_secs))??;
        if outcome.is_none() {
            bail!("daemon closed the connection before {request_id} finished");
        }
    }

    output(&SendOutput { response, outcome }, json_mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pushed(event: &str, request_id: &str) -> WireResponse {
        WireResponse {
            event: event.to_string(),
            data: Some(json!({"event": event, "data": {"request_id": request_id}})),
            correlation_id: None,
            error: None,
            push: true,
        }
    }

    #[test]
    fn test_is_terminal_for_matches_request() {
        assert!(is_terminal_for(&pushed("completion:result", "r1"), "r1"));
        assert!(is_terminal_for(&pushed("completion:cancelled", "r1"), "r1"));
        assert!(!is_terminal_for(&pushed("completion:result", "r2"), "r1"));
        assert!(!is_terminal_for(&pushed("completion:dispatched", "r1"), "r1"));

        let mut not_pushed = pushed("completion:error", "r1");
        not_pushed.push = false;
        assert!(!is_terminal_for(&not_pushed, "r1"));
    }
}
