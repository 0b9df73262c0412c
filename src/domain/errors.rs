//! Domain errors for the switchyard coordination daemon.

use thiserror::Error;

/// Domain-level errors that can occur while routing and orchestrating events.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Conversation {conversation_id} is locked by request {holder}")]
    LockConflict {
        conversation_id: String,
        holder: String,
    },

    #[error("Fork detected on conversation {conversation_id}")]
    ForkDetected { conversation_id: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Circuit breaker tripped for chain {chain_root}: {reason}")]
    CircuitBreakerTripped { chain_root: String, reason: String },

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Correlation not found: {0}")]
    CorrelationNotFound(String),

    #[error("Submission rejected: {0}")]
    PermissionDenied(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// Stable snake_case identifier used in wire-level error objects.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed(_) => "validation_error",
            Self::LockConflict { .. } => "lock_conflict",
            Self::ForkDetected { .. } => "fork_detected",
            Self::Provider(_) => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::CircuitBreakerTripped { .. } => "circuit_breaker_tripped",
            Self::RequestNotFound(_) | Self::ConversationNotFound(_) | Self::CorrelationNotFound(_) => {
                "not_found"
            }
            Self::PermissionDenied(_) => "permission_denied",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Errors that answer the caller rather than indicate a handler failure.
    ///
    /// The router surfaces these when no primary handler produced a result.
    pub fn is_caller_facing(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed(_)
                | Self::RequestNotFound(_)
                | Self::ConversationNotFound(_)
                | Self::CorrelationNotFound(_)
                | Self::PermissionDenied(_)
        )
    }

    /// Wire representation: `{"kind": ..., "message": ...}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(DomainError::ValidationFailed("x".into()).kind(), "validation_error");
        assert_eq!(DomainError::Timeout { after_ms: 10 }.kind(), "timeout");
        assert_eq!(DomainError::RequestNotFound("r".into()).kind(), "not_found");
        assert_eq!(
            DomainError::CircuitBreakerTripped {
                chain_root: "c1".into(),
                reason: "depth".into()
            }
            .kind(),
            "circuit_breaker_tripped"
        );
    }

    #[test]
    fn test_caller_facing_classification() {
        assert!(DomainError::ValidationFailed("bad".into()).is_caller_facing());
        assert!(DomainError::RequestNotFound("r".into()).is_caller_facing());
        assert!(!DomainError::Provider("boom".into()).is_caller_facing());
        assert!(!DomainError::Internal("oops".into()).is_caller_facing());
    }

    #[test]
    fn test_to_json_shape() {
        let json = DomainError::LockConflict {
            conversation_id: "c1".into(),
            holder: "req-a".into(),
        }
        .to_json();
        assert_eq!(json["kind"], "lock_conflict");
        assert!(json["message"].as_str().unwrap().contains("req-a"));
    }
}
