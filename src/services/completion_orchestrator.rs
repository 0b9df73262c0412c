//! Completion orchestrator.
//!
//! Accepts completion requests and guarantees that, per session, at most
//! one request moves towards the provider at a time. Requests without a
//! session are dispatched immediately. Every provider call runs in its own
//! task bounded by the request deadline and a cancellation token; its
//! outcome is reported through the router before the session advances.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::conversation_locks::ConversationLockManager;
use super::event_router::EventRouter;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    names, CompletionRequest, CompletionResult, CompletionStatus, CorrelationId, EventContext,
    FailureReason, LockOutcome, OrchestratorConfig, RequestId, SessionQueue,
};
use crate::domain::ports::{
    AllowAllGate, CompletionProvider, ProviderRequest, ProviderResponse, SubmissionGate,
};

/// Snapshot of one session's queue.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub in_flight: Option<RequestId>,
    pub in_flight_status: Option<CompletionStatus>,
    pub pending: Vec<RequestId>,
}

/// Request counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStats {
    pub queued: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub sessions: usize,
    pub lock_waiters: usize,
}

/// Per-session ordering and provider dispatch.
pub struct CompletionOrchestrator {
    config: OrchestratorConfig,
    provider: Arc<dyn CompletionProvider>,
    router: Arc<EventRouter>,
    locks: Arc<ConversationLockManager>,
    gate: Arc<dyn SubmissionGate>,
    requests: DashMap<RequestId, CompletionRequest>,
    sessions: DashMap<String, SessionQueue>,
    inflight: DashMap<RequestId, CancellationToken>,
    lock_waiters: DashMap<String, VecDeque<RequestId>>,
}

impl CompletionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn CompletionProvider>,
        router: Arc<EventRouter>,
        locks: Arc<ConversationLockManager>,
    ) -> Self {
        Self {
            config,
            provider,
            router,
            locks,
            gate: Arc::new(AllowAllGate),
            requests: DashMap::new(),
            sessions: DashMap::new(),
            inflight: DashMap::new(),
            lock_waiters: DashMap::new(),
        }
    }

    /// Consult `gate` before admitting requests.
    pub fn with_gate(mut self, gate: Arc<dyn SubmissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    async fn emit(&self, name: &str, data: Value, parent: Option<CorrelationId>) {
        self.router
            .emit(name, data, EventContext::internal(parent))
            .await;
    }

    /// Admit a request: dispatch it now if its session is idle, otherwise queue it.
    #[instrument(skip(self, request), fields(request_id = %request.request_id, session_id = ?request.session_id))]
    pub async fn submit(self: &Arc<Self>, request: CompletionRequest) -> DomainResult<RequestId> {
        self.gate.check(&request).await?;

        let request_id = request.request_id.clone();
        let session_id = request.session_id.clone();
        let priority = request.priority;
        let parent = request.correlation_id;

        match self.requests.entry(request_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DomainError::ValidationFailed(format!(
                    "request {request_id} already exists"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(request);
            }
        }

        let dispatch_now = match &session_id {
            None => true,
            Some(session) => {
                let mut queue = self.sessions.entry(session.clone()).or_default();
                if queue.is_idle() {
                    queue.claim(request_id.clone());
                    true
                } else if queue.len() >= self.config.max_queue_per_session {
                    drop(queue);
                    self.requests.remove(&request_id);
                    return Err(DomainError::ValidationFailed(format!(
                        "session {session} already has {} queued requests",
                        self.config.max_queue_per_session
                    )));
                } else {
                    queue.enqueue(request_id.clone(), priority);
                    false
                }
            }
        };

        if dispatch_now {
            if !self.start(request_id.clone()).await {
                if let Some(session) = &session_id {
                    self.advance_session(session, &request_id).await;
                }
            }
        } else {
            let position = session_id
                .as_ref()
                .and_then(|s| self.sessions.get(s).and_then(|q| q.position(&request_id)));
            debug!(position = ?position, "completion queued behind in-flight request");
            self.emit(
                names::COMPLETION_QUEUED,
                json!({
                    "request_id": request_id,
                    "session_id": session_id,
                    "priority": priority,
                    "position": position,
                }),
                parent,
            )
            .await;
        }
        Ok(request_id)
    }

    /// Move a claimed request towards the provider.
    ///
    /// Returns `true` if the request now occupies its session slot (either
    /// dispatched or parked on a conversation lock) and `false` if it could
    /// not be started because it is no longer queued.
    async fn start(self: &Arc<Self>, request_id: RequestId) -> bool {
        let (conversation_id, session_id) = match self.requests.get(&request_id) {
            Some(r) if r.status == CompletionStatus::Queued => {
                (r.conversation_id.clone(), r.session_id.clone())
            }
            _ => return false,
        };

        if let Some(conversation_id) = &conversation_id {
            loop {
                let outcome = self
                    .locks
                    .acquire(
                        conversation_id,
                        &request_id,
                        json!({"session_id": session_id, "purpose": "completion"}),
                    )
                    .await;
                match outcome {
                    Ok(LockOutcome::Acquired) => break,
                    Ok(LockOutcome::Locked { holder }) => {
                        self.lock_waiters
                            .entry(conversation_id.clone())
                            .or_default()
                            .push_back(request_id.clone());
                        if self.locks.status(conversation_id).is_some() {
                            debug!(
                                request_id = %request_id,
                                conversation_id = %conversation_id,
                                holder = %holder,
                                "conversation busy, waiting for lock"
                            );
                            return true;
                        }
                        // Freed in the meantime; retry unless a waker already took us.
                        if !self.remove_waiter(conversation_id, &request_id) {
                            return true;
                        }
                    }
                    Err(e) => {
                        self.fail_queued(&request_id, &e).await;
                        return false;
                    }
                }
            }
        }

        let provider_request = self.requests.get_mut(&request_id).and_then(|mut request| {
            if request.status != CompletionStatus::Queued {
                None
            } else if let Err(e) = request.transition_to(CompletionStatus::Dispatched) {
                warn!(request_id = %request_id, error = %e, "cannot dispatch request");
                None
            } else {
                Some((
                    ProviderRequest {
                        request_id: request_id.clone(),
                        prompt: request.prompt.clone(),
                        conversation_id: request.conversation_id.clone(),
                        model: request.model.clone(),
                        deadline: request.deadline.unwrap_or_else(Utc::now),
                    },
                    request.timeout_ms,
                    request.correlation_id,
                    request.chain.depth,
                ))
            }
        });

        let Some((provider_request, timeout_ms, parent, chain_depth)) = provider_request else {
            // Cancelled or evicted while waiting on the lock.
            self.locks.release(&request_id).await;
            return false;
        };

        let token = CancellationToken::new();
        self.inflight.insert(request_id.clone(), token.clone());
        info!(
            request_id = %request_id,
            session_id = ?session_id,
            conversation_id = ?conversation_id,
            provider = self.provider.name(),
            "completion dispatched"
        );
        self.emit(
            names::COMPLETION_DISPATCHED,
            json!({
                "request_id": request_id,
                "session_id": session_id,
                "conversation_id": conversation_id,
                "deadline": provider_request.deadline,
                "chain_depth": chain_depth,
            }),
            parent,
        )
        .await;
        self.spawn_provider_call(provider_request, Duration::from_millis(timeout_ms), token);
        true
    }

    fn spawn_provider_call(
        self: &Arc<Self>,
        provider_request: ProviderRequest,
        timeout: Duration,
        token: CancellationToken,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = provider_request.request_id.clone();
            let (progress_tx, mut progress_rx) = mpsc::channel::<Value>(32);
            let forwarder = {
                let this = Arc::clone(&this);
                let request_id = request_id.clone();
                tokio::spawn(async move {
                    while let Some(progress) = progress_rx.recv().await {
                        this.emit_progress(&request_id, progress).await;
                    }
                })
            };

            // The conversation lock must outlive the call, however long it runs.
            let holds_lock = provider_request.conversation_id.is_some();
            let period = this.locks.renew_interval();
            let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let call = this.provider.invoke(provider_request, progress_tx);
            tokio::pin!(call);

            let outcome = loop {
                tokio::select! {
                    () = token.cancelled() => {
                        break Err(DomainError::Internal("provider call aborted".to_string()));
                    }
                    () = &mut deadline => {
                        break Err(DomainError::Timeout {
                            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    result = &mut call => break result,
                    _ = heartbeat.tick(), if holds_lock => {
                        if let Err(e) = this.locks.renew(&request_id) {
                            debug!(request_id = %request_id, error = %e, "lock renewal skipped");
                        }
                    }
                }
            };
            if let Err(e) = forwarder.await {
                warn!(request_id = %request_id, error = %e, "progress forwarder failed");
            }
            this.on_provider_result(&request_id, outcome).await;
        });
    }

    async fn emit_progress(&self, request_id: &RequestId, progress: Value) {
        let (session_id, parent) = match self.requests.get(request_id) {
            Some(r) if !r.cancel_requested => (r.session_id.clone(), r.correlation_id),
            _ => return,
        };
        self.emit(
            names::COMPLETION_PROGRESS,
            json!({"request_id": request_id, "session_id": session_id, "progress": progress}),
            parent,
        )
        .await;
    }

    /// Record the outcome of a provider call and advance the session.
    #[instrument(skip(self, outcome), fields(request_id = %request_id))]
    pub async fn on_provider_result(
        self: &Arc<Self>,
        request_id: &RequestId,
        outcome: DomainResult<ProviderResponse>,
    ) {
        self.inflight.remove(request_id);

        let request = {
            let Some(mut request) = self.requests.get_mut(request_id) else {
                warn!("provider result for unknown request");
                return;
            };
            if request.status != CompletionStatus::Dispatched {
                debug!(status = request.status.as_str(), "ignoring late provider result");
                return;
            }
            let next = if request.cancel_requested {
                CompletionStatus::Cancelled
            } else {
                match outcome {
                    Ok(response) => {
                        request.result = Some(CompletionResult {
                            response: response.response,
                            conversation_id: response.conversation_id,
                            usage: response.usage,
                        });
                        CompletionStatus::Completed
                    }
                    Err(e) => {
                        request.failure = Some(match e {
                            DomainError::Timeout { after_ms } => FailureReason::Timeout { after_ms },
                            DomainError::Provider(message) => FailureReason::Provider { message },
                            other => FailureReason::Provider {
                                message: other.to_string(),
                            },
                        });
                        CompletionStatus::Failed
                    }
                }
            };
            if let Err(e) = request.transition_to(next) {
                warn!(error = %e, "invalid terminal transition");
                return;
            }
            request.clone()
        };

        if request.status == CompletionStatus::Completed {
            let reported = request
                .result
                .as_ref()
                .and_then(|r| r.conversation_id.as_deref());
            self.locks
                .complete_turn(request_id, request.conversation_id.as_deref(), reported)
                .await;
        }
        self.locks.release(request_id).await;

        self.emit_terminal(&request).await;

        if let Some(session) = &request.session_id {
            self.advance_session(session, request_id).await;
        }
    }

    async fn emit_terminal(&self, request: &CompletionRequest) {
        let parent = request.correlation_id;
        match request.status {
            CompletionStatus::Completed => {
                let result = request.result.as_ref();
                info!(request_id = %request.request_id, "completion finished");
                self.emit(
                    names::COMPLETION_RESULT,
                    json!({
                        "request_id": request.request_id,
                        "session_id": request.session_id,
                        "conversation_id": result
                            .and_then(|r| r.conversation_id.clone())
                            .or_else(|| request.conversation_id.clone()),
                        "previous_conversation_id": request.conversation_id,
                        "response": result.map(|r| r.response.clone()),
                        "usage": result.and_then(|r| r.usage.clone()),
                        "injection": request.injection,
                        "chain_depth": request.chain.depth,
                        "chain_root": request.chain.root,
                    }),
                    parent,
                )
                .await;
            }
            CompletionStatus::Failed => {
                let error = request
                    .failure
                    .as_ref()
                    .map_or_else(|| DomainError::Internal("unknown failure".to_string()), FailureReason::to_error);
                info!(request_id = %request.request_id, error = %error, "completion failed");
                self.emit(
                    names::COMPLETION_ERROR,
                    json!({
                        "request_id": request.request_id,
                        "session_id": request.session_id,
                        "conversation_id": request.conversation_id,
                        "error": error.to_json(),
                    }),
                    parent,
                )
                .await;
            }
            CompletionStatus::Cancelled => {
                info!(request_id = %request.request_id, "completion cancelled");
                self.emit(
                    names::COMPLETION_CANCELLED,
                    json!({
                        "request_id": request.request_id,
                        "session_id": request.session_id,
                        "was_dispatched": request.dispatched_at.is_some(),
                    }),
                    parent,
                )
                .await;
            }
            CompletionStatus::Queued | CompletionStatus::Dispatched => {}
        }
    }

    /// Free the session slot held by `finished` and start the next request.
    async fn advance_session(self: &Arc<Self>, session_id: &str, finished: &RequestId) {
        let mut finished = finished.clone();
        loop {
            let next = {
                let Some(mut queue) = self.sessions.get_mut(session_id) else {
                    return;
                };
                if !queue.release(&finished) && queue.in_flight().is_some() {
                    // Someone else owns the slot.
                    return;
                }
                let next = queue.pop_next();
                if let Some(next) = &next {
                    queue.claim(next.clone());
                }
                next
            };
            let Some(next) = next else {
                self.sessions.remove_if(session_id, |_, q| q.is_idle());
                return;
            };
            if self.start(next.clone()).await {
                return;
            }
            finished = next;
        }
    }

    async fn fail_queued(self: &Arc<Self>, request_id: &RequestId, error: &DomainError) {
        let request = {
            let Some(mut request) = self.requests.get_mut(request_id) else {
                return;
            };
            request.failure = Some(FailureReason::Provider {
                message: error.to_string(),
            });
            if request.transition_to(CompletionStatus::Failed).is_err() {
                return;
            }
            request.clone()
        };
        self.emit_terminal(&request).await;
    }

    fn remove_waiter(&self, conversation_id: &str, request_id: &RequestId) -> bool {
        let removed = match self.lock_waiters.get_mut(conversation_id) {
            Some(mut waiters) => match waiters.iter().position(|id| id == request_id) {
                Some(pos) => {
                    waiters.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        };
        self.lock_waiters
            .remove_if(conversation_id, |_, waiters| waiters.is_empty());
        removed
    }

    /// Wake the next request parked on `conversation_id`.
    pub async fn retry_lock_waiters(self: &Arc<Self>, conversation_id: &str) {
        loop {
            let next = {
                let Some(mut waiters) = self.lock_waiters.get_mut(conversation_id) else {
                    return;
                };
                waiters.pop_front()
            };
            self.lock_waiters
                .remove_if(conversation_id, |_, waiters| waiters.is_empty());
            let Some(next) = next else {
                return;
            };
            debug!(request_id = %next, conversation_id, "retrying lock for waiting request");
            if self.start(next.clone()).await {
                return;
            }
            let session = self.requests.get(&next).and_then(|r| r.session_id.clone());
            if let Some(session) = session {
                self.advance_session(&session, &next).await;
            }
        }
    }

    /// Cancel a request.
    ///
    /// Queued requests are removed without a provider call. Dispatched
    /// requests are aborted when the provider supports it; otherwise the
    /// slot stays occupied and the eventual result is discarded. Returns
    /// `false` if the request had already finished.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub async fn cancel(self: &Arc<Self>, request_id: &RequestId) -> DomainResult<bool> {
        loop {
            let (status, session_id, conversation_id) = match self.requests.get(request_id) {
                Some(r) => (r.status, r.session_id.clone(), r.conversation_id.clone()),
                None => return Err(DomainError::RequestNotFound(request_id.to_string())),
            };

            match status {
                CompletionStatus::Queued => {
                    let dequeued = session_id
                        .as_ref()
                        .and_then(|s| self.sessions.get_mut(s).map(|mut q| q.remove(request_id)))
                        .unwrap_or(false);
                    let parked = conversation_id
                        .as_deref()
                        .is_some_and(|c| self.remove_waiter(c, request_id));

                    let request = {
                        let Some(mut request) = self.requests.get_mut(request_id) else {
                            return Err(DomainError::RequestNotFound(request_id.to_string()));
                        };
                        if request.status != CompletionStatus::Queued {
                            // Dispatched in the meantime.
                            continue;
                        }
                        request.transition_to(CompletionStatus::Cancelled)?;
                        request.clone()
                    };
                    debug!(dequeued, parked, "cancelled queued request");
                    self.emit_terminal(&request).await;

                    if parked {
                        if let Some(session) = &session_id {
                            self.advance_session(session, request_id).await;
                        }
                    }
                    return Ok(true);
                }
                CompletionStatus::Dispatched => {
                    if let Some(mut request) = self.requests.get_mut(request_id) {
                        request.cancel_requested = true;
                    }
                    if self.provider.supports_abort() {
                        if let Some(token) = self.inflight.get(request_id) {
                            token.cancel();
                        }
                    } else {
                        info!("provider cannot abort; result will be discarded");
                    }
                    return Ok(true);
                }
                CompletionStatus::Completed
                | CompletionStatus::Failed
                | CompletionStatus::Cancelled => return Ok(false),
            }
        }
    }

    pub fn status(&self, request_id: &RequestId) -> DomainResult<CompletionRequest> {
        self.requests
            .get(request_id)
            .map(|r| r.clone())
            .ok_or_else(|| DomainError::RequestNotFound(request_id.to_string()))
    }

    pub fn session_status(&self, session_id: &str) -> SessionStatus {
        let (in_flight, pending) = self
            .sessions
            .get(session_id)
            .map(|q| (q.in_flight().cloned(), q.pending()))
            .unwrap_or_default();
        let in_flight_status = in_flight
            .as_ref()
            .and_then(|id| self.requests.get(id).map(|r| r.status));
        SessionStatus {
            session_id: session_id.to_string(),
            in_flight,
            in_flight_status,
            pending,
        }
    }

    /// Whether `session_id` has nothing in flight and nothing queued.
    pub fn session_is_idle(&self, session_id: &str) -> bool {
        self.sessions.get(session_id).is_none_or(|q| q.is_idle())
    }

    pub fn stats(&self) -> OrchestratorStats {
        let mut stats = OrchestratorStats::default();
        for request in &self.requests {
            match request.status {
                CompletionStatus::Queued => stats.queued += 1,
                CompletionStatus::Dispatched => stats.dispatched += 1,
                CompletionStatus::Completed => stats.completed += 1,
                CompletionStatus::Failed => stats.failed += 1,
                CompletionStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.sessions = self.sessions.len();
        stats.lock_waiters = self.lock_waiters.iter().map(|w| w.len()).sum();
        stats
    }

    /// Drop terminal requests that finished longer than `retention` ago.
    pub fn evict_terminal(&self, retention: chrono::Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let before = self.requests.len();
        self.requests.retain(|_, r| {
            !(r.status.is_terminal() && r.finished_at.is_some_and(|t| t < cutoff))
        });
        before.saturating_sub(self.requests.len())
    }

    /// Abort every in-flight provider call.
    pub fn abort_all(&self) {
        for token in &self.inflight {
            token.cancel();
        }
    }
}
