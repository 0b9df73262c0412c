//! Claude CLI completion provider.
//!
//! Spawns the `claude` CLI in print mode for each completion. The prompt is
//! written to stdin, `--resume` continues an existing conversation, and the
//! `session_id` of the final result becomes the new conversation id. Both
//! `json` and `stream-json` output are understood: every non-result line is
//! forwarded as progress. The child is killed when the call is dropped.

use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ProviderConfig;
use crate::domain::ports::{CompletionProvider, ProviderRequest, ProviderResponse};

/// Claude CLI provider configuration.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    /// Path to claude CLI binary
    pub binary_path: String,
    /// Model used when a request names none
    pub default_model: Option<String>,
    /// Output format for print mode (json or stream-json)
    pub output_format: String,
    /// Working directory for the child process
    pub working_dir: Option<String>,
    /// Additional CLI flags
    pub extra_flags: Vec<String>,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary_path: "claude".to_string(),
            default_model: None,
            output_format: "json".to_string(),
            working_dir: None,
            extra_flags: vec![],
        }
    }
}

impl From<&ProviderConfig> for ClaudeCliConfig {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            binary_path: config.claude_path.clone(),
            default_model: config.model.clone(),
            working_dir: config.working_dir.clone(),
            extra_flags: config.extra_args.clone(),
            ..Default::default()
        }
    }
}

/// One parsed line of CLI output.
#[derive(Debug, Clone, PartialEq)]
enum CliLine {
    Result {
        response: Value,
        session_id: Option<String>,
        usage: Option<Value>,
        is_error: bool,
    },
    Progress(Value),
}

/// Completion provider backed by the `claude` CLI.
pub struct ClaudeCliProvider {
    config: ClaudeCliConfig,
}

impl ClaudeCliProvider {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self { config }
    }

    /// Build CLI arguments for a request.
    fn build_args(&self, request: &ProviderRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            self.config.output_format.clone(),
        ];
        if self.config.output_format == "stream-json" {
            args.push("--verbose".to_string());
        }

        if let Some(conversation) = &request.conversation_id {
            args.push("--resume".to_string());
            args.push(conversation.clone());
        }

        if let Some(model) = request.model.as_ref().or(self.config.default_model.as_ref()) {
            args.push("--model".to_string());
            args.push(model.clone());
        }

        args.extend(self.config.extra_flags.iter().cloned());
        args
    }

    fn prompt_text(prompt: &Value) -> String {
        match prompt {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn parse_line(line: &str) -> Option<CliLine> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let Ok(json) = serde_json::from_str::<Value>(trimmed) else {
            return Some(CliLine::Progress(Value::String(trimmed.to_string())));
        };
        if json.get("type").and_then(Value::as_str) == Some("result") {
            return Some(CliLine::Result {
                response: json.get("result").cloned().unwrap_or(Value::Null),
                session_id: json
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                usage: json.get("usage").cloned(),
                is_error: json.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            });
        }
        Some(CliLine::Progress(json))
    }
}

#[async_trait]
impl CompletionProvider for ClaudeCliProvider {
    fn name(&self) -> &'static str {
        "claude_cli"
    }

    async fn invoke(
        &self,
        request: ProviderRequest,
        progress: mpsc::Sender<Value>,
    ) -> DomainResult<ProviderResponse> {
        let args = self.build_args(&request);
        let mut cmd = Command::new(&self.config.binary_path);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("SWITCHYARD_REQUEST_ID", request.request_id.as_str());

        debug!(request_id = %request.request_id, args = ?args, "spawning claude");
        let mut child = cmd
            .spawn()
            .map_err(|e| DomainError::Provider(format!("failed to spawn {}: {e}", self.config.binary_path)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DomainError::Provider("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DomainError::Provider("failed to capture stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| DomainError::Provider("failed to capture stderr".to_string()))?;

        stdin
            .write_all(Self::prompt_text(&request.prompt).as_bytes())
            .await
            .map_err(|e| DomainError::Provider(format!("failed to write prompt: {e}")))?;
        drop(stdin);

        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        let mut result = None;
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| DomainError::Provider(format!("failed to read output: {e}")))?;
            let Some(line) = line else { break };
            match Self::parse_line(&line) {
                Some(CliLine::Progress(value)) => {
                    // Receiver gone just means nobody listens.
                    let _ = progress.send(value).await;
                }
                Some(parsed @ CliLine::Result { .. }) => result = Some(parsed),
                None => {}
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DomainError::Provider(format!("failed to wait for claude: {e}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        match result {
            Some(CliLine::Result {
                response,
                session_id,
                usage,
                is_error,
            }) => {
                if is_error || !status.success() {
                    let message = response
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| response.to_string());
                    return Err(DomainError::Provider(message));
                }
                Ok(ProviderResponse {
                    response,
                    conversation_id: session_id.or(request.conversation_id),
                    usage,
                })
            }
            _ => {
                let message = if stderr_text.trim().is_empty() {
                    format!("claude exited with {status} and no result")
                } else {
                    stderr_text.trim().to_string()
                };
                warn!(request_id = %request.request_id, error = %message, "claude call failed");
                Err(DomainError::Provider(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::RequestId;
    use chrono::Utc;
    use serde_json::json;

    fn request(conversation: Option<&str>, model: Option<&str>) -> ProviderRequest {
        ProviderRequest {
            request_id: RequestId::from("r1"),
            prompt: json!("hello"),
            conversation_id: conversation.map(str::to_string),
            model: model.map(str::to_string),
            deadline: Utc::now(),
        }
    }

    #[test]
    fn test_build_args_resume_and_model() {
        let provider = ClaudeCliProvider::new(ClaudeCliConfig {
            default_model: Some("sonnet".into()),
            extra_flags: vec!["--max-turns".into(), "3".into()],
            ..Default::default()
        });
        let args = provider.build_args(&request(Some("c1"), None));
        assert_eq!(
            args,
            vec!["--print", "--output-format", "json", "--resume", "c1", "--model", "sonnet", "--max-turns", "3"]
        );

        let args = provider.build_args(&request(None, Some("opus")));
        assert!(!args.contains(&"--resume".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "opus"));
    }

    #[test]
    fn test_stream_json_adds_verbose() {
        let provider = ClaudeCliProvider::new(ClaudeCliConfig {
            output_format: "stream-json".into(),
            ..Default::default()
        });
        assert!(provider.build_args(&request(None, None)).contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_parse_result_line() {
        let line = r#"{"type":"result","result":"hi there","session_id":"abc","is_error":false,"usage":{"input_tokens":3}}"#;
        assert_eq!(
            ClaudeCliProvider::parse_line(line),
            Some(CliLine::Result {
                response: json!("hi there"),
                session_id: Some("abc".into()),
                usage: Some(json!({"input_tokens": 3})),
                is_error: false,
            })
        );
    }

    #[test]
    fn test_parse_progress_lines() {
        let line = r#"{"type":"assistant","message":{"content":"thinking"}}"#;
        assert!(matches!(ClaudeCliProvider::parse_line(line), Some(CliLine::Progress(_))));
        assert_eq!(
            ClaudeCliProvider::parse_line("plain text"),
            Some(CliLine::Progress(json!("plain text")))
        );
        assert_eq!(ClaudeCliProvider::parse_line("   "), None);
    }

    #[test]
    fn test_prompt_text() {
        assert_eq!(ClaudeCliProvider::prompt_text(&json!("x")), "x");
        assert_eq!(ClaudeCliProvider::prompt_text(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_missing_binary_is_provider_error() {
        let provider = ClaudeCliProvider::new(ClaudeCliConfig {
            binary_path: "/nonexistent/switchyard-test-claude".into(),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(1);
        let err = provider.invoke(request(None, None), tx).await.unwrap_err();
        assert_eq!(err.kind(), "provider_error");
    }
}
