//! Events routed through the daemon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::errors::DomainError;

/// Causal identifier linking an event to the event that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::ValidationFailed(format!("invalid correlation id '{s}': {e}")))
    }
}

/// Where an event came from.
///
/// Only `External` events count as human/external input for circuit breaker resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// A connected client.
    External,
    /// A component of the daemon reacting to another event.
    #[default]
    Internal,
    /// The injection router re-submitting a completion result.
    Injection,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
            Self::Injection => "injection",
        }
    }
}

/// Dispatch context supplied by the producer of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventContext {
    /// Correlation id to adopt; a fresh one is assigned when absent.
    pub correlation_id: Option<CorrelationId>,
    /// The event whose handling produced this one.
    pub parent_correlation_id: Option<CorrelationId>,
    pub origin: EventOrigin,
    /// Connection that submitted the event, if any.
    pub client_id: Option<String>,
}

impl EventContext {
    /// Context for an event submitted by a client.
    pub fn external() -> Self {
        Self {
            origin: EventOrigin::External,
            ..Default::default()
        }
    }

    /// Context for an event produced while handling `parent`.
    pub fn internal(parent: Option<CorrelationId>) -> Self {
        Self {
            parent_correlation_id: parent,
            origin: EventOrigin::Internal,
            ..Default::default()
        }
    }

    /// Context for a re-submission made by the injection router.
    pub fn injection(parent: Option<CorrelationId>) -> Self {
        Self {
            parent_correlation_id: parent,
            origin: EventOrigin::Injection,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// A named message with a data payload. Immutable once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: Value,
    pub context: EventContext,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// The `namespace` part of `namespace:action`.
    pub fn namespace(&self) -> &str {
        self.name.split(':').next().unwrap_or("")
    }

    pub fn origin(&self) -> EventOrigin {
        self.context.origin
    }

    /// String field from the data payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Required string field; missing or empty values are validation errors.
    pub fn require_str(&self, key: &str) -> Result<&str, DomainError> {
        match self.str_field(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(DomainError::ValidationFailed(format!(
                "{} requires a non-empty '{}' field",
                self.name, key
            ))),
        }
    }

    /// Wire form pushed to subscribers.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "event": self.name,
            "data": self.data,
            "correlation_id": self.correlation_id,
            "parent_correlation_id": self.context.parent_correlation_id,
            "origin": self.context.origin,
            "timestamp": self.timestamp,
        })
    }
}

/// Validate an event name: non-empty, no whitespace, no empty segments.
pub fn validate_event_name(name: &str) -> Result<(), DomainError> {
    if name.is_empty() {
        return Err(DomainError::ValidationFailed("event name cannot be empty".to_string()));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(DomainError::ValidationFailed(format!(
            "event name '{name}' cannot contain whitespace"
        )));
    }
    if name.split(':').any(str::is_empty) {
        return Err(DomainError::ValidationFailed(format!(
            "event name '{name}' has an empty segment"
        )));
    }
    Ok(())
}

/// Event names consumed and produced by the core.
pub mod names {
    pub const COMPLETION_ASYNC: &str = "completion:async";
    pub const COMPLETION_CANCEL: &str = "completion:cancel";
    pub const COMPLETION_STATUS: &str = "completion:status";
    pub const COMPLETION_SESSION_STATUS: &str = "completion:session_status";
    pub const COMPLETION_QUEUED: &str = "completion:queued";
    pub const COMPLETION_DISPATCHED: &str = "completion:dispatched";
    pub const COMPLETION_RESULT: &str = "completion:result";
    pub const COMPLETION_ERROR: &str = "completion:error";
    pub const COMPLETION_CANCELLED: &str = "completion:cancelled";
    pub const COMPLETION_PROGRESS: &str = "completion:progress";

    pub const CONVERSATION_ACQUIRE_LOCK: &str = "conversation:acquire_lock";
    pub const CONVERSATION_RELEASE_LOCK: &str = "conversation:release_lock";
    pub const CONVERSATION_LOCK_STATUS: &str = "conversation:lock_status";
    pub const CONVERSATION_RENEW_LOCK: &str = "conversation:renew_lock";
    pub const CONVERSATION_LOCK_ACQUIRED: &str = "conversation:lock_acquired";
    pub const CONVERSATION_LOCK_RELEASED: &str = "conversation:lock_released";
    pub const CONVERSATION_STALE_LOCK_RELEASED: &str = "conversation:stale_lock_released";
    pub const CONVERSATION_FORK_DETECTED: &str = "conversation:fork_detected";

    pub const INJECTION_INJECT: &str = "injection:inject";
    pub const INJECTION_BATCH: &str = "injection:batch";
    pub const INJECTION_CLEAR: &str = "injection:clear";
    pub const INJECTION_LIST: &str = "injection:list";
    pub const INJECTION_STATUS: &str = "injection:status";
    pub const INJECTION_QUEUED: &str = "injection:queued";
    pub const INJECTION_SUBMITTED: &str = "injection:submitted";
    pub const INJECTION_BREAKER_TRIPPED: &str = "injection:circuit_breaker_tripped";

    pub const CORRELATION_TRACE: &str = "correlation:trace";
    pub const CORRELATION_CHAIN: &str = "correlation:chain";
    pub const CORRELATION_TREE: &str = "correlation:tree";
    pub const CORRELATION_STATS: &str = "correlation:stats";
    pub const CORRELATION_CLEANUP: &str = "correlation:cleanup";

    pub const SYSTEM_HEALTH: &str = "system:health";
    pub const SYSTEM_SUBSCRIBE: &str = "system:subscribe";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_event_name() {
        assert!(validate_event_name("completion:async").is_ok());
        assert!(validate_event_name("system:health").is_ok());
        assert!(validate_event_name("").is_err());
        assert!(validate_event_name("completion: async").is_err());
        assert!(validate_event_name("completion::async").is_err());
        assert!(validate_event_name(":async").is_err());
    }

    #[test]
    fn test_correlation_id_parse() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<CorrelationId>().is_err());
    }

    #[test]
    fn test_require_str() {
        let event = Event {
            name: "completion:cancel".to_string(),
            data: serde_json::json!({"request_id": "abc", "empty": ""}),
            context: EventContext::external(),
            correlation_id: CorrelationId::new(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.require_str("request_id").unwrap(), "abc");
        assert!(event.require_str("empty").is_err());
        assert!(event.require_str("missing").is_err());
        assert_eq!(event.namespace(), "completion");
    }
}
