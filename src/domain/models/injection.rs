//! Injection domain model.
//!
//! An injection turns a completion result into a new completion request,
//! closing the provider-output-to-provider-input loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::completion::{RequestId, RequestPriority};

/// When an injected request is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// Buffer per session and flush after the coalescing window.
    #[default]
    Next,
    /// Submit right away.
    Immediate,
}

impl InjectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Immediate => "immediate",
        }
    }
}

/// Injection instructions attached to a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionMetadata {
    #[serde(default)]
    pub mode: InjectionMode,
    /// Session to inject into; defaults to the originating request's session.
    #[serde(default)]
    pub target_session_id: Option<String>,
    #[serde(default)]
    pub priority: RequestPriority,
}

/// One pending re-submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionEntry {
    pub content: Value,
    pub target_session_id: String,
    pub mode: InjectionMode,
    pub priority: RequestPriority,
    pub origin_request_id: Option<RequestId>,
    pub chain_depth: u32,
    /// Circuit breaker key shared by the whole chain.
    pub chain_root: String,
    /// Conversation to continue, taken from the origin's result.
    pub conversation_id: Option<String>,
    /// Injection metadata carried onto the submitted request so the chain can continue.
    pub carry: Option<InjectionMetadata>,
    pub queued_at: DateTime<Utc>,
}

impl InjectionEntry {
    /// Content rendered as text for merging.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Merge entries into a single prompt, preserving arrival order.
pub fn merge_contents(entries: &[InjectionEntry]) -> Value {
    if entries.len() == 1 {
        return entries[0].content.clone();
    }
    let merged = entries
        .iter()
        .map(InjectionEntry::content_text)
        .collect::<Vec<_>>()
        .join("\n\n");
    Value::String(merged)
}
