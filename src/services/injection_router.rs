//! Injection router.
//!
//! Turns completion results that carry injection metadata into new
//! completion requests. Every attempt passes the chain circuit breaker
//! first; a tripped breaker is reported as an event and nothing is
//! submitted. `immediate` entries are submitted at once, `next` entries are
//! buffered per target session and merged after the coalescing window.
//! Submissions go back through the router as injection-origin
//! `completion:async` events, so they are traced as children of the result
//! that caused them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::circuit_breaker::{BreakerCheck, ChainCircuitBreaker, CircuitBreakerConfig};
use super::event_router::EventRouter;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    merge_contents, names, CorrelationId, EventContext, InjectionConfig, InjectionEntry,
    InjectionMetadata, InjectionMode, RequestId, RequestPriority,
};

/// What happened to an accepted injection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InjectionOutcome {
    Submitted { request_id: Option<String> },
    Buffered { target_session_id: String, position: usize },
}

/// Parameters of a manual `injection:inject`.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualInjection {
    pub content: Value,
    pub target_session_id: String,
    #[serde(default)]
    pub mode: InjectionMode,
    #[serde(default)]
    pub priority: RequestPriority,
    pub conversation_id: Option<String>,
    /// Injection metadata for the submitted request, to start a chain.
    pub injection: Option<InjectionMetadata>,
}

#[derive(Debug, Clone)]
struct Buffered {
    entry: InjectionEntry,
    parent: Option<CorrelationId>,
}

/// Routes completion output back into the orchestrator.
pub struct InjectionRouter {
    config: InjectionConfig,
    router: Arc<EventRouter>,
    breaker: ChainCircuitBreaker,
    buffers: DashMap<String, Vec<Buffered>>,
    coalesce_window: Duration,
}

impl InjectionRouter {
    pub fn new(config: InjectionConfig, router: Arc<EventRouter>) -> Self {
        let breaker_config = CircuitBreakerConfig {
            enabled: config.enabled,
            ..CircuitBreakerConfig::from(&config)
        };
        Self {
            coalesce_window: Duration::from_millis(config.coalesce_window_ms),
            breaker: ChainCircuitBreaker::new(breaker_config),
            config,
            router,
            buffers: DashMap::new(),
        }
    }

    pub fn breaker(&self) -> &ChainCircuitBreaker {
        &self.breaker
    }

    /// Handle a `completion:result` payload.
    ///
    /// Returns `Ok(None)` when the result does not ask for an injection.
    #[instrument(skip(self, result, metadata), fields(request_id = %request_id))]
    pub async fn process_result(
        self: &Arc<Self>,
        request_id: &RequestId,
        result: &Value,
        metadata: &InjectionMetadata,
        parent: Option<CorrelationId>,
    ) -> DomainResult<Option<InjectionOutcome>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let response = result.get("response").cloned().unwrap_or(Value::Null);
        if response.get("inject").and_then(Value::as_bool) == Some(false) {
            debug!("result opted out of injection");
            return Ok(None);
        }
        if response.is_null() {
            return Ok(None);
        }

        let origin_session = result.get("session_id").and_then(Value::as_str);
        let Some(target) = metadata
            .target_session_id
            .as_deref()
            .or(origin_session)
            .map(str::to_string)
        else {
            return Err(DomainError::ValidationFailed(
                "injection needs a target session".to_string(),
            ));
        };
        let depth = result
            .get("chain_depth")
            .and_then(Value::as_u64)
            .and_then(|d| u32::try_from(d).ok())
            .unwrap_or(0);
        let chain_root = result
            .get("chain_root")
            .and_then(Value::as_str)
            .map_or_else(|| target.clone(), str::to_string);
        // Same session continues the conversation the provider just reported.
        let conversation_id = if Some(target.as_str()) == origin_session {
            result
                .get("conversation_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };

        let entry = InjectionEntry {
            content: response,
            target_session_id: target,
            mode: metadata.mode,
            priority: metadata.priority,
            origin_request_id: Some(request_id.clone()),
            chain_depth: depth.saturating_add(1),
            chain_root,
            conversation_id,
            carry: Some(metadata.clone()),
            queued_at: Utc::now(),
        };
        self.admit(entry, parent).await.map(Some)
    }

    /// Inject content directly into a session.
    pub async fn inject(
        self: &Arc<Self>,
        params: ManualInjection,
        parent: Option<CorrelationId>,
    ) -> DomainResult<InjectionOutcome> {
        if params.target_session_id.is_empty() {
            return Err(DomainError::ValidationFailed(
                "target_session_id cannot be empty".to_string(),
            ));
        }
        if params.content.is_null() {
            return Err(DomainError::ValidationFailed("content is required".to_string()));
        }
        let entry = InjectionEntry {
            content: params.content,
            chain_root: params.target_session_id.clone(),
            target_session_id: params.target_session_id,
            mode: params.mode,
            priority: params.priority,
            origin_request_id: None,
            chain_depth: 1,
            conversation_id: params.conversation_id,
            carry: params.injection,
            queued_at: Utc::now(),
        };
        self.admit(entry, parent).await
    }

    /// Inject several entries, reporting each outcome in order.
    pub async fn batch(
        self: &Arc<Self>,
        entries: Vec<ManualInjection>,
        parent: Option<CorrelationId>,
    ) -> Vec<DomainResult<InjectionOutcome>> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            outcomes.push(self.inject(entry, parent).await);
        }
        outcomes
    }

    async fn admit(
        self: &Arc<Self>,
        entry: InjectionEntry,
        parent: Option<CorrelationId>,
    ) -> DomainResult<InjectionOutcome> {
        if let BreakerCheck::Tripped { reason } =
            self.breaker.record_attempt(&entry.chain_root, entry.chain_depth)
        {
            self.router
                .emit(
                    names::INJECTION_BREAKER_TRIPPED,
                    json!({
                        "chain_root": entry.chain_root,
                        "chain_depth": entry.chain_depth,
                        "target_session_id": entry.target_session_id,
                        "origin_request_id": entry.origin_request_id,
                        "reason": reason,
                    }),
                    EventContext::internal(parent),
                )
                .await;
            return Err(DomainError::CircuitBreakerTripped {
                chain_root: entry.chain_root,
                reason,
            });
        }

        match entry.mode {
            InjectionMode::Immediate => {
                let request_id = self.submit(vec![Buffered { entry, parent }]).await?;
                Ok(InjectionOutcome::Submitted { request_id })
            }
            InjectionMode::Next => {
                let target = entry.target_session_id.clone();
                let (position, first) = {
                    let mut buffer = self.buffers.entry(target.clone()).or_default();
                    buffer.push(Buffered {
                        entry: entry.clone(),
                        parent,
                    });
                    (buffer.len() - 1, buffer.len() == 1)
                };
                debug!(target_session_id = %target, position, "injection buffered");
                self.router
                    .emit(
                        names::INJECTION_QUEUED,
                        json!({
                            "target_session_id": target,
                            "position": position,
                            "chain_depth": entry.chain_depth,
                            "chain_root": entry.chain_root,
                            "origin_request_id": entry.origin_request_id,
                        }),
                        EventContext::internal(parent),
                    )
                    .await;
                if first {
                    self.schedule_flush(target.clone());
                }
                Ok(InjectionOutcome::Buffered {
                    target_session_id: target,
                    position,
                })
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>, target: String) {
        let this = Arc::clone(self);
        let window = self.coalesce_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Err(e) = this.flush(&target).await {
                warn!(target_session_id = %target, error = %e, "failed to submit buffered injections");
            }
        });
    }

    /// Submit everything buffered for `target` as one request.
    pub async fn flush(&self, target: &str) -> DomainResult<Option<String>> {
        let Some((_, entries)) = self.buffers.remove(target) else {
            return Ok(None);
        };
        if entries.is_empty() {
            return Ok(None);
        }
        self.submit(entries).await
    }

    async fn submit(&self, buffered: Vec<Buffered>) -> DomainResult<Option<String>> {
        let entries: Vec<InjectionEntry> = buffered.iter().map(|b| b.entry.clone()).collect();
        let Some(last) = entries.last() else {
            return Ok(None);
        };
        let first = &entries[0];
        let parent = buffered.last().and_then(|b| b.parent);
        let chain_depth = entries.iter().map(|e| e.chain_depth).max().unwrap_or(1);
        let priority = if entries.iter().any(|e| e.priority == RequestPriority::High) {
            RequestPriority::High
        } else {
            RequestPriority::Normal
        };
        let conversation_id = entries.iter().rev().find_map(|e| e.conversation_id.clone());

        let data = json!({
            "prompt": merge_contents(&entries),
            "session_id": last.target_session_id,
            "conversation_id": conversation_id,
            "priority": priority,
            "injection": last.carry,
            "chain_depth": chain_depth,
            "chain_root": first.chain_root,
            "origin_request_id": last.origin_request_id,
        });
        let dispatched = self
            .router
            .dispatch(names::COMPLETION_ASYNC, data, EventContext::injection(parent))
            .await?;
        let request_id = dispatched
            .result
            .as_ref()
            .and_then(|r| r.get("request_id"))
            .and_then(Value::as_str)
            .map(str::to_string);

        info!(
            target_session_id = %last.target_session_id,
            request_id = ?request_id,
            chain_depth,
            merged = entries.len(),
            "injection submitted"
        );
        self.router
            .emit(
                names::INJECTION_SUBMITTED,
                json!({
                    "request_id": request_id,
                    "target_session_id": last.target_session_id,
                    "chain_depth": chain_depth,
                    "chain_root": first.chain_root,
                    "merged": entries.len(),
                }),
                EventContext::internal(Some(dispatched.correlation_id)),
            )
            .await;
        Ok(request_id)
    }

    /// Buffered entries, optionally for one session.
    pub fn list(&self, target: Option<&str>) -> Vec<InjectionEntry> {
        let mut entries: Vec<InjectionEntry> = self
            .buffers
            .iter()
            .filter(|b| target.is_none_or(|t| t == b.key().as_str()))
            .flat_map(|b| b.value().iter().map(|x| x.entry.clone()).collect::<Vec<_>>())
            .collect();
        entries.sort_by_key(|e| e.queued_at);
        entries
    }

    /// Drop buffered entries, optionally for one session. Returns how many were dropped.
    pub fn clear(&self, target: Option<&str>) -> usize {
        match target {
            Some(target) => self.buffers.remove(target).map_or(0, |(_, b)| b.len()),
            None => {
                let dropped = self.buffers.iter().map(|b| b.len()).sum();
                self.buffers.clear();
                dropped
            }
        }
    }

    /// External input arrived for `chain_root`; close its breaker.
    pub fn observe_external(&self, chain_root: &str) -> bool {
        self.breaker.reset(chain_root)
    }

    pub fn prune_breakers(&self) -> usize {
        self.breaker.prune_idle()
    }

    pub fn status(&self) -> Value {
        let buffered: serde_json::Map<String, Value> = self
            .buffers
            .iter()
            .map(|b| (b.key().clone(), Value::from(b.len())))
            .collect();
        let total: usize = self.buffers.iter().map(|b| b.len()).sum();
        json!({
            "enabled": self.config.enabled,
            "queued": total,
            "buffered": buffered,
            "circuit_breakers": self.breaker.states(),
            "breaker_stats": self.breaker.stats(),
        })
    }
}
