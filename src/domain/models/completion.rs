//! Completion request domain model.
//!
//! A completion request is one unit of work submitted to the external
//! provider. Only the orchestrator mutates it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::event::{CorrelationId, EventOrigin};
use super::injection::InjectionMetadata;
use crate::domain::errors::{DomainError, DomainResult};

/// Unique identifier of a completion request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Admission lane within a session queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    #[default]
    Normal,
    High,
}

impl RequestPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Lifecycle status of a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Queued,
    Dispatched,
    Completed,
    Failed,
    Cancelled,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [CompletionStatus] {
        match self {
            Self::Queued => &[Self::Dispatched, Self::Cancelled, Self::Failed],
            Self::Dispatched => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Why a request ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Provider { message: String },
    Timeout { after_ms: u64 },
}

impl FailureReason {
    pub fn to_error(&self) -> DomainError {
        match self {
            Self::Provider { message } => DomainError::Provider(message.clone()),
            Self::Timeout { after_ms } => DomainError::Timeout { after_ms: *after_ms },
        }
    }
}

/// Successful provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub response: Value,
    /// Conversation identifier reported by the provider; may differ from the one supplied.
    pub conversation_id: Option<String>,
    pub usage: Option<Value>,
}

/// Position of a request inside an injection chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub depth: u32,
    pub root: String,
    pub origin_request_id: Option<RequestId>,
}

/// Wire parameters of `completion:async`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitParams {
    #[serde(default)]
    pub prompt: Value,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub priority: RequestPriority,
    pub timeout_secs: Option<u64>,
    pub injection: Option<InjectionMetadata>,
    pub request_id: Option<String>,
    // Honoured only for injection-origin submissions.
    pub chain_depth: Option<u32>,
    pub chain_root: Option<String>,
    pub origin_request_id: Option<String>,
}

/// One unit of work submitted to the external provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub request_id: RequestId,
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
    pub prompt: Value,
    pub model: Option<String>,
    pub priority: RequestPriority,
    pub status: CompletionStatus,
    pub timeout_ms: u64,
    pub injection: Option<InjectionMetadata>,
    pub chain: ChainInfo,
    pub origin: EventOrigin,
    /// Correlation id of the event that submitted this request.
    pub correlation_id: Option<CorrelationId>,
    pub submitted_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureReason>,
    pub result: Option<CompletionResult>,
    /// Set when a dispatched request was cancelled on a provider that cannot abort.
    pub cancel_requested: bool,
}

/// Chain root: session, else conversation, else the request itself.
pub fn chain_root_for(session_id: Option<&str>, conversation_id: Option<&str>, request_id: &RequestId) -> String {
    session_id
        .or(conversation_id)
        .map_or_else(|| request_id.to_string(), ToString::to_string)
}

impl CompletionRequest {
    /// Create a queued request with a fresh id.
    pub fn new(prompt: Value) -> Self {
        let request_id = RequestId::new();
        let root = request_id.to_string();
        Self {
            request_id,
            session_id: None,
            conversation_id: None,
            prompt,
            model: None,
            priority: RequestPriority::Normal,
            status: CompletionStatus::Queued,
            timeout_ms: 300_000,
            injection: None,
            chain: ChainInfo {
                depth: 0,
                root,
                origin_request_id: None,
            },
            origin: EventOrigin::Internal,
            correlation_id: None,
            submitted_at: Utc::now(),
            dispatched_at: None,
            deadline: None,
            finished_at: None,
            failure: None,
            result: None,
            cancel_requested: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self.refresh_root();
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self.refresh_root();
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_injection(mut self, injection: InjectionMetadata) -> Self {
        self.injection = Some(injection);
        self
    }

    pub fn with_origin(mut self, origin: EventOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_chain(mut self, chain: ChainInfo) -> Self {
        self.chain = chain;
        self
    }

    fn refresh_root(&mut self) {
        if self.chain.depth == 0 {
            self.chain.root = chain_root_for(
                self.session_id.as_deref(),
                self.conversation_id.as_deref(),
                &self.request_id,
            );
        }
    }

    /// Build a request from `completion:async` parameters.
    ///
    /// Chain position is taken from the parameters only for injection-origin
    /// submissions; every other origin starts a new chain.
    pub fn from_params(
        params: SubmitParams,
        origin: EventOrigin,
        correlation_id: Option<CorrelationId>,
        default_timeout_ms: u64,
        max_timeout_ms: u64,
    ) -> DomainResult<Self> {
        let prompt_missing = match &params.prompt {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        };
        if prompt_missing {
            return Err(DomainError::ValidationFailed(
                "completion:async requires a non-empty 'prompt'".to_string(),
            ));
        }
        if params.session_id.as_deref() == Some("") {
            return Err(DomainError::ValidationFailed("session_id cannot be empty".to_string()));
        }
        if params.conversation_id.as_deref() == Some("") {
            return Err(DomainError::ValidationFailed(
                "conversation_id cannot be empty".to_string(),
            ));
        }

        let timeout_ms = match params.timeout_secs {
            Some(0) => {
                return Err(DomainError::ValidationFailed("timeout_secs must be positive".to_string()))
            }
            Some(secs) => secs.saturating_mul(1000).min(max_timeout_ms),
            None => default_timeout_ms,
        };

        let request_id = match params.request_id {
            Some(id) if id.is_empty() => {
                return Err(DomainError::ValidationFailed("request_id cannot be empty".to_string()))
            }
            Some(id) => RequestId(id),
            None => RequestId::new(),
        };

        let root = chain_root_for(
            params.session_id.as_deref(),
            params.conversation_id.as_deref(),
            &request_id,
        );
        let chain = if origin == EventOrigin::Injection {
            ChainInfo {
                depth: params.chain_depth.unwrap_or(1),
                root: params.chain_root.unwrap_or(root),
                origin_request_id: params.origin_request_id.map(RequestId),
            }
        } else {
            ChainInfo {
                depth: 0,
                root,
                origin_request_id: None,
            }
        };

        let mut request = Self::new(params.prompt);
        request.request_id = request_id;
        request.session_id = params.session_id;
        request.conversation_id = params.conversation_id;
        request.model = params.model;
        request.priority = params.priority;
        request.timeout_ms = timeout_ms;
        request.injection = params.injection;
        request.chain = chain;
        request.origin = origin;
        request.correlation_id = correlation_id;
        Ok(request)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a new status, stamping lifecycle timestamps.
    pub fn transition_to(&mut self, next: CompletionStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::Internal(format!(
                "request {} cannot transition from {} to {}",
                self.request_id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        let now = Utc::now();
        self.status = next;
        match next {
            CompletionStatus::Dispatched => {
                self.dispatched_at = Some(now);
                let timeout = i64::try_from(self.timeout_ms).unwrap_or(i64::MAX);
                self.deadline = Some(now + Duration::milliseconds(timeout));
            }
            CompletionStatus::Completed | CompletionStatus::Failed | CompletionStatus::Cancelled => {
                self.finished_at = Some(now);
            }
            CompletionStatus::Queued => {}
        }
        Ok(())
    }

    /// Status payload returned by `completion:status`.
    pub fn status_json(&self) -> Value {
        serde_json::json!({
            "request_id": self.request_id,
            "session_id": self.session_id,
            "conversation_id": self.conversation_id,
            "status": self.status,
            "priority": self.priority,
            "chain_depth": self.chain.depth,
            "chain_root": self.chain.root,
            "origin": self.origin,
            "submitted_at": self.submitted_at,
            "dispatched_at": self.dispatched_at,
            "deadline": self.deadline,
            "finished_at": self.finished_at,
            "failure": self.failure,
            "cancel_requested": self.cancel_requested,
            "result_conversation_id": self.result.as_ref().and_then(|r| r.conversation_id.clone()),
        })
    }
}
