//! Conversation lock manager.
//!
//! Mutual exclusion keyed by conversation id, with TTL-based stale lock
//! reclamation and tracking of provider-side identifier rotation. Each
//! conversation's state lives in its own map entry, so unrelated
//! conversations never contend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::event_router::EventRouter;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    names, ConversationLock, EventContext, LockOutcome, LocksConfig, RequestId, RotationRecord,
    TurnOutcome,
};

/// Conversation lock table.
pub struct ConversationLockManager {
    locks: DashMap<String, ConversationLock>,
    by_holder: DashMap<RequestId, Vec<String>>,
    rotations: DashMap<String, RotationRecord>,
    config: LocksConfig,
    router: Option<Arc<EventRouter>>,
}

impl ConversationLockManager {
    pub fn new(config: LocksConfig) -> Self {
        Self {
            locks: DashMap::new(),
            by_holder: DashMap::new(),
            rotations: DashMap::new(),
            config,
            router: None,
        }
    }

    /// Publish lock lifecycle events through `router`.
    pub fn with_router(mut self, router: Arc<EventRouter>) -> Self {
        self.router = Some(router);
        self
    }

    async fn emit(&self, name: &str, data: Value) {
        if let Some(router) = &self.router {
            router.emit(name, data, EventContext::internal(None)).await;
        }
    }

    /// Try to take the lock on `conversation_id` for `request_id`.
    ///
    /// Re-acquiring a lock already held by the same request renews it. An
    /// expired lock held by someone else is reclaimed.
    #[instrument(skip(self, request_id, metadata), fields(request_id = %request_id))]
    pub async fn acquire(
        &self,
        conversation_id: &str,
        request_id: &RequestId,
        metadata: Value,
    ) -> DomainResult<LockOutcome> {
        if conversation_id.is_empty() {
            return Err(DomainError::ValidationFailed(
                "conversation_id cannot be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let mut reclaimed = None;
        let mut newly_acquired = false;

        let outcome = match self.locks.entry(conversation_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get_mut();
                if &current.holder == request_id {
                    current.renew();
                    LockOutcome::Acquired
                } else if current.is_expired_at(now) {
                    let fresh = ConversationLock::new(
                        conversation_id,
                        request_id.clone(),
                        self.config.ttl_ms,
                        metadata,
                    );
                    reclaimed = Some(std::mem::replace(current, fresh));
                    newly_acquired = true;
                    LockOutcome::Acquired
                } else {
                    LockOutcome::Locked {
                        holder: current.holder.clone(),
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(ConversationLock::new(
                    conversation_id,
                    request_id.clone(),
                    self.config.ttl_ms,
                    metadata,
                ));
                newly_acquired = true;
                LockOutcome::Acquired
            }
        };

        if let Some(stale) = reclaimed {
            self.forget_holder(&stale.holder, conversation_id);
            warn!(
                conversation_id,
                stale_holder = %stale.holder,
                "reclaimed expired conversation lock"
            );
            self.emit(
                names::CONVERSATION_STALE_LOCK_RELEASED,
                json!({
                    "conversation_id": conversation_id,
                    "request_id": stale.holder,
                    "acquired_at": stale.acquired_at,
                }),
            )
            .await;
        }

        if newly_acquired {
            self.by_holder
                .entry(request_id.clone())
                .or_default()
                .push(conversation_id.to_string());
            debug!(conversation_id, "conversation lock acquired");
            self.emit(
                names::CONVERSATION_LOCK_ACQUIRED,
                json!({"conversation_id": conversation_id, "request_id": request_id}),
            )
            .await;
        }

        Ok(outcome)
    }

    fn forget_holder(&self, holder: &RequestId, conversation_id: &str) {
        let now_empty = match self.by_holder.get_mut(holder) {
            Some(mut held) => {
                held.retain(|c| c != conversation_id);
                held.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_holder.remove_if(holder, |_, held| held.is_empty());
        }
    }

    /// Release every lock held by `request_id`. Returns the released conversations.
    #[instrument(skip(self, request_id), fields(request_id = %request_id))]
    pub async fn release(&self, request_id: &RequestId) -> Vec<String> {
        let held = self
            .by_holder
            .remove(request_id)
            .map(|(_, held)| held)
            .unwrap_or_default();

        let mut released = Vec::new();
        for conversation_id in held {
            if self
                .locks
                .remove_if(&conversation_id, |_, lock| &lock.holder == request_id)
                .is_some()
            {
                released.push(conversation_id);
            }
        }

        for conversation_id in &released {
            debug!(conversation_id = %conversation_id, "conversation lock released");
            self.emit(
                names::CONVERSATION_LOCK_RELEASED,
                json!({"conversation_id": conversation_id, "request_id": request_id}),
            )
            .await;
        }
        released
    }

    /// Extend the TTL of every lock held by `request_id`.
    pub fn renew(&self, request_id: &RequestId) -> DomainResult<usize> {
        let held = self
            .by_holder
            .get(request_id)
            .map(|h| h.clone())
            .unwrap_or_default();
        let mut renewed = 0;
        for conversation_id in held {
            if let Some(mut lock) = self.locks.get_mut(&conversation_id) {
                if &lock.holder == request_id {
                    lock.renew();
                    renewed += 1;
                }
            }
        }
        if renewed == 0 {
            return Err(DomainError::RequestNotFound(format!(
                "request {request_id} holds no conversation locks"
            )));
        }
        Ok(renewed)
    }

    /// Current holder of `conversation_id`, ignoring expired locks.
    pub fn status(&self, conversation_id: &str) -> Option<ConversationLock> {
        self.locks
            .get(conversation_id)
            .filter(|lock| !lock.is_expired_at(Utc::now()))
            .map(|lock| lock.clone())
    }

    /// How often a live holder renews so that its locks never reach the TTL.
    pub fn renew_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis((self.config.ttl_ms / 2).max(1))
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn rotation(&self, from: &str) -> Option<RotationRecord> {
        self.rotations.get(from).map(|r| r.clone())
    }

    /// Release locks whose holder did not renew within the TTL.
    pub async fn sweep_expired(&self) -> Vec<ConversationLock> {
        let now = Utc::now();
        let expired_ids: Vec<String> = self
            .locks
            .iter()
            .filter(|lock| lock.is_expired_at(now))
            .map(|lock| lock.key().clone())
            .collect();

        let mut swept = Vec::new();
        for conversation_id in expired_ids {
            if let Some((_, lock)) = self
                .locks
                .remove_if(&conversation_id, |_, lock| lock.is_expired_at(now))
            {
                self.forget_holder(&lock.holder, &conversation_id);
                swept.push(lock);
            }
        }

        for lock in &swept {
            warn!(
                conversation_id = %lock.conversation_id,
                holder = %lock.holder,
                "released stale conversation lock"
            );
            self.emit(
                names::CONVERSATION_STALE_LOCK_RELEASED,
                json!({
                    "conversation_id": lock.conversation_id,
                    "request_id": lock.holder,
                    "acquired_at": lock.acquired_at,
                }),
            )
            .await;
        }
        swept
    }

    /// Account for the conversation id a provider reported after a turn.
    ///
    /// A changed id is recorded as a rotation `locked -> reported`. If a
    /// different request already rotated `locked` to another id, the
    /// conversation has forked; this is reported, never resolved here.
    pub async fn complete_turn(
        &self,
        request_id: &RequestId,
        locked: Option<&str>,
        reported: Option<&str>,
    ) -> TurnOutcome {
        let (from, to) = match (locked, reported) {
            (Some(from), Some(to)) if from != to => (from, to),
            _ => return TurnOutcome::Unchanged,
        };

        let outcome = match self.rotations.entry(from.to_string()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().clone();
                if &existing.request_id == request_id {
                    entry.get_mut().to = to.to_string();
                    TurnOutcome::Rotated {
                        from: from.to_string(),
                        to: to.to_string(),
                    }
                } else if existing.to == to {
                    TurnOutcome::Unchanged
                } else {
                    TurnOutcome::Forked {
                        conversation_id: from.to_string(),
                        existing,
                        branch: to.to_string(),
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(RotationRecord {
                    from: from.to_string(),
                    to: to.to_string(),
                    request_id: request_id.clone(),
                    rotated_at: Utc::now(),
                });
                TurnOutcome::Rotated {
                    from: from.to_string(),
                    to: to.to_string(),
                }
            }
        };

        match &outcome {
            TurnOutcome::Rotated { from, to } => {
                debug!(from = %from, to = %to, request_id = %request_id, "conversation id rotated");
            }
            TurnOutcome::Forked {
                conversation_id,
                existing,
                branch,
            } => {
                info!(
                    conversation_id = %conversation_id,
                    existing_branch = %existing.to,
                    new_branch = %branch,
                    request_id = %request_id,
                    "conversation fork detected"
                );
                self.emit(
                    names::CONVERSATION_FORK_DETECTED,
                    json!({
                        "conversation_id": conversation_id,
                        "existing_branch": existing.to,
                        "existing_request_id": existing.request_id,
                        "new_branch": branch,
                        "request_id": request_id,
                        "error": DomainError::ForkDetected {
                            conversation_id: conversation_id.clone(),
                        }
                        .to_json(),
                    }),
                )
                .await;
            }
            TurnOutcome::Unchanged => {}
        }
        outcome
    }

    /// Forget rotation records older than the configured retention.
    pub fn prune_rotations(&self) -> usize {
        let retention = i64::try_from(self.config.rotation_retention_secs).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - Duration::seconds(retention);
        let before = self.rotations.len();
        self.rotations.retain(|_, record| record.rotated_at >= cutoff);
        before.saturating_sub(self.rotations.len())
    }
}
