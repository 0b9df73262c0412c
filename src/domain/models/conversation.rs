//! Conversation lock and rotation records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::completion::RequestId;

/// Exclusive claim on a conversation by one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLock {
    pub conversation_id: String,
    pub holder: RequestId,
    pub acquired_at: DateTime<Utc>,
    /// Last acquire or renew.
    pub renewed_at: DateTime<Utc>,
    pub ttl_ms: u64,
    #[serde(default)]
    pub metadata: Value,
}

impl ConversationLock {
    pub fn new(conversation_id: impl Into<String>, holder: RequestId, ttl_ms: u64, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            holder,
            acquired_at: now,
            renewed_at: now,
            ttl_ms,
            metadata,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.renewed_at + Duration::milliseconds(i64::try_from(self.ttl_ms).unwrap_or(i64::MAX))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn renew(&mut self) {
        self.renewed_at = Utc::now();
    }
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Locked { holder: RequestId },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

/// A provider-side identifier rotation `from -> to` observed after a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationRecord {
    pub from: String,
    pub to: String,
    pub request_id: RequestId,
    pub rotated_at: DateTime<Utc>,
}

/// What the lock manager concluded when a turn finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The provider kept the conversation id, or no id was involved.
    Unchanged,
    /// Clean identifier rotation.
    Rotated { from: String, to: String },
    /// A second request rotated the same original id to a different branch.
    Forked {
        conversation_id: String,
        existing: RotationRecord,
        branch: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_expiry() {
        let lock = ConversationLock::new("c1", RequestId::from("r1"), 1_000, Value::Null);
        assert!(!lock.is_expired_at(lock.renewed_at));
        assert!(lock.is_expired_at(lock.renewed_at + Duration::milliseconds(1_000)));
    }

    #[test]
    fn test_renew_moves_expiry() {
        let mut lock = ConversationLock::new("c1", RequestId::from("r1"), 1_000, Value::Null);
        lock.renewed_at -= Duration::milliseconds(900);
        let before = lock.expires_at();
        lock.renew();
        assert!(lock.expires_at() > before);
        assert!(lock.acquired_at <= lock.renewed_at);
    }
}
