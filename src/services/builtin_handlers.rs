//! Built-in event handlers.
//!
//! Primary handlers expose the core components on the wire, one handler
//! per namespace. Observers wire the components to each other: completion
//! results feed the injection router, external submissions reset chain
//! breakers, and released locks wake parked requests.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::completion_orchestrator::CompletionOrchestrator;
use super::conversation_locks::ConversationLockManager;
use super::correlation_tracer::CorrelationTracer;
use super::event_router::{priority, EventHandler, EventRouter, HandlerMode};
use super::injection_router::{InjectionRouter, ManualInjection};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    chain_root_for, names, CompletionRequest, CorrelationId, Event, EventOrigin,
    InjectionMetadata, LockOutcome, RequestId, SubmitParams,
};

/// Deserialize the event payload, reporting bad input as a validation error.
fn params<T: DeserializeOwned>(event: &Event) -> DomainResult<T> {
    serde_json::from_value(event.data.clone())
        .map_err(|e| DomainError::ValidationFailed(format!("{}: {e}", event.name)))
}

fn correlation_param(event: &Event) -> DomainResult<CorrelationId> {
    event.require_str("correlation_id")?.parse()
}

// ============================================================================
// CompletionCommandHandler
// ============================================================================

/// `completion:async`, `completion:cancel`, `completion:status`, `completion:session_status`.
pub struct CompletionCommandHandler {
    orchestrator: Arc<CompletionOrchestrator>,
}

impl CompletionCommandHandler {
    pub fn new(orchestrator: Arc<CompletionOrchestrator>) -> Self {
        Self { orchestrator }
    }

    async fn submit(&self, event: &Event) -> DomainResult<Value> {
        let submit: SubmitParams = params(event)?;
        let config = self.orchestrator.config();
        let request = CompletionRequest::from_params(
            submit,
            event.origin(),
            Some(event.correlation_id),
            config.default_timeout_ms,
            config.max_timeout_ms,
        )?;
        let request_id = self.orchestrator.submit(request).await?;
        let status = self.orchestrator.status(&request_id)?;
        Ok(json!({
            "request_id": request_id,
            "status": status.status,
            "session_id": status.session_id,
            "chain_depth": status.chain.depth,
        }))
    }
}

#[async_trait]
impl EventHandler for CompletionCommandHandler {
    fn name(&self) -> &str {
        "CompletionCommandHandler"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        let value = match event.name.as_str() {
            names::COMPLETION_ASYNC => self.submit(event).await?,
            names::COMPLETION_CANCEL => {
                let request_id = RequestId::from(event.require_str("request_id")?);
                let cancelled = self.orchestrator.cancel(&request_id).await?;
                let status = self.orchestrator.status(&request_id)?;
                json!({
                    "request_id": request_id,
                    "cancelled": cancelled,
                    "status": status.status,
                    "cancel_requested": status.cancel_requested,
                })
            }
            names::COMPLETION_STATUS => {
                let request_id = RequestId::from(event.require_str("request_id")?);
                let request = self.orchestrator.status(&request_id)?;
                let mut status = request.status_json();
                status["result"] = serde_json::to_value(&request.result)?;
                status
            }
            names::COMPLETION_SESSION_STATUS => {
                let session_id = event.require_str("session_id")?;
                serde_json::to_value(self.orchestrator.session_status(session_id))?
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

// ============================================================================
// ConversationCommandHandler
// ============================================================================

#[derive(Debug, Deserialize)]
struct AcquireParams {
    conversation_id: String,
    request_id: String,
    #[serde(default)]
    metadata: Value,
}

/// Explicit lock control for collaborators that coordinate by hand.
pub struct ConversationCommandHandler {
    locks: Arc<ConversationLockManager>,
}

impl ConversationCommandHandler {
    pub fn new(locks: Arc<ConversationLockManager>) -> Self {
        Self { locks }
    }
}

#[async_trait]
impl EventHandler for ConversationCommandHandler {
    fn name(&self) -> &str {
        "ConversationCommandHandler"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        let value = match event.name.as_str() {
            names::CONVERSATION_ACQUIRE_LOCK => {
                let p: AcquireParams = params(event)?;
                if p.request_id.is_empty() {
                    return Err(DomainError::ValidationFailed(
                        "request_id cannot be empty".to_string(),
                    ));
                }
                let request_id = RequestId::from(p.request_id);
                match self.locks.acquire(&p.conversation_id, &request_id, p.metadata).await? {
                    LockOutcome::Acquired => json!({
                        "acquired": true,
                        "conversation_id": p.conversation_id,
                        "holder": request_id,
                    }),
                    LockOutcome::Locked { holder } => {
                        let conflict = DomainError::LockConflict {
                            conversation_id: p.conversation_id.clone(),
                            holder: holder.to_string(),
                        };
                        json!({
                            "acquired": false,
                            "conversation_id": p.conversation_id,
                            "holder": holder,
                            "error": conflict.to_json(),
                        })
                    }
                }
            }
            names::CONVERSATION_RELEASE_LOCK => {
                let request_id = RequestId::from(event.require_str("request_id")?);
                let released = self.locks.release(&request_id).await;
                json!({"request_id": request_id, "released": released})
            }
            names::CONVERSATION_RENEW_LOCK => {
                let request_id = RequestId::from(event.require_str("request_id")?);
                let renewed = self.locks.renew(&request_id)?;
                json!({"request_id": request_id, "renewed": renewed})
            }
            names::CONVERSATION_LOCK_STATUS => {
                let conversation_id = event.require_str("conversation_id")?;
                match self.locks.status(conversation_id) {
                    Some(lock) => json!({
                        "conversation_id": conversation_id,
                        "locked": true,
                        "holder": lock.holder,
                        "acquired_at": lock.acquired_at,
                        "expires_at": lock.expires_at(),
                        "metadata": lock.metadata,
                    }),
                    None => json!({"conversation_id": conversation_id, "locked": false}),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

// ============================================================================
// InjectionCommandHandler
// ============================================================================

#[derive(Debug, Deserialize)]
struct BatchParams {
    entries: Vec<ManualInjection>,
}

fn injection_reply(outcome: DomainResult<super::injection_router::InjectionOutcome>) -> DomainResult<Value> {
    match outcome {
        Ok(outcome) => {
            let mut value = serde_json::to_value(outcome)?;
            value["accepted"] = Value::Bool(true);
            Ok(value)
        }
        Err(e @ DomainError::CircuitBreakerTripped { .. }) => {
            Ok(json!({"accepted": false, "error": e.to_json()}))
        }
        Err(e) => Err(e),
    }
}

/// Manual injection and buffer inspection.
pub struct InjectionCommandHandler {
    injection: Arc<InjectionRouter>,
}

impl InjectionCommandHandler {
    pub fn new(injection: Arc<InjectionRouter>) -> Self {
        Self { injection }
    }
}

#[async_trait]
impl EventHandler for InjectionCommandHandler {
    fn name(&self) -> &str {
        "InjectionCommandHandler"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        let parent = Some(event.correlation_id);
        let target = event.str_field("target_session_id");
        let value = match event.name.as_str() {
            names::INJECTION_INJECT => {
                let manual: ManualInjection = params(event)?;
                injection_reply(self.injection.inject(manual, parent).await)?
            }
            names::INJECTION_BATCH => {
                let batch: BatchParams = params(event)?;
                let mut results = Vec::with_capacity(batch.entries.len());
                for outcome in self.injection.batch(batch.entries, parent).await {
                    results.push(match injection_reply(outcome) {
                        Ok(v) => v,
                        Err(e) => json!({"accepted": false, "error": e.to_json()}),
                    });
                }
                json!({"results": results})
            }
            names::INJECTION_LIST => json!({"entries": self.injection.list(target)}),
            names::INJECTION_CLEAR => json!({"cleared": self.injection.clear(target)}),
            names::INJECTION_STATUS => self.injection.status(),
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

// ============================================================================
// CorrelationQueryHandler
// ============================================================================

/// Tracer queries and maintenance.
pub struct CorrelationQueryHandler {
    tracer: Arc<CorrelationTracer>,
    default_max_age: chrono::Duration,
}

impl CorrelationQueryHandler {
    pub fn new(tracer: Arc<CorrelationTracer>, default_max_age: chrono::Duration) -> Self {
        Self {
            tracer,
            default_max_age,
        }
    }
}

#[async_trait]
impl EventHandler for CorrelationQueryHandler {
    fn name(&self) -> &str {
        "CorrelationQueryHandler"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        let value = match event.name.as_str() {
            names::CORRELATION_TRACE => serde_json::to_value(self.tracer.get(correlation_param(event)?)?)?,
            names::CORRELATION_CHAIN => {
                let chain = self.tracer.chain(correlation_param(event)?)?;
                json!({"chain": chain, "length": chain.len()})
            }
            names::CORRELATION_TREE => {
                let tree = self.tracer.tree(correlation_param(event)?)?;
                json!({"size": tree.size(), "tree": tree})
            }
            names::CORRELATION_STATS => serde_json::to_value(self.tracer.stats())?,
            names::CORRELATION_CLEANUP => {
                let max_age = match event.data.get("max_age_secs") {
                    None | Some(Value::Null) => self.default_max_age,
                    Some(v) => {
                        let secs = v.as_i64().filter(|s| *s >= 0).ok_or_else(|| {
                            DomainError::ValidationFailed(
                                "max_age_secs must be a non-negative integer".to_string(),
                            )
                        })?;
                        chrono::Duration::seconds(secs)
                    }
                };
                json!({"removed": self.tracer.cleanup(max_age), "remaining": self.tracer.len()})
            }
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

// ============================================================================
// HealthHandler
// ============================================================================

/// `system:health`.
pub struct HealthHandler {
    started: Instant,
    router: Weak<EventRouter>,
    orchestrator: Arc<CompletionOrchestrator>,
    locks: Arc<ConversationLockManager>,
}

impl HealthHandler {
    pub fn new(
        router: &Arc<EventRouter>,
        orchestrator: Arc<CompletionOrchestrator>,
        locks: Arc<ConversationLockManager>,
    ) -> Self {
        Self {
            started: Instant::now(),
            router: Arc::downgrade(router),
            orchestrator,
            locks,
        }
    }
}

#[async_trait]
impl EventHandler for HealthHandler {
    fn name(&self) -> &str {
        "HealthHandler"
    }

    async fn handle(&self, _event: &Event) -> DomainResult<Option<Value>> {
        let Some(router) = self.router.upgrade() else {
            return Ok(None);
        };
        Ok(Some(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": self.started.elapsed().as_secs(),
            "handlers": router.handler_count().await,
            "dispatched": router.dispatched_count(),
            "requests": self.orchestrator.stats(),
            "locks": self.locks.lock_count(),
            "traces": router.tracer().len(),
        })))
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Feeds `completion:result` events carrying injection metadata to the injection router.
pub struct InjectionResultObserver {
    injection: Arc<InjectionRouter>,
}

impl InjectionResultObserver {
    pub fn new(injection: Arc<InjectionRouter>) -> Self {
        Self { injection }
    }
}

#[async_trait]
impl EventHandler for InjectionResultObserver {
    fn name(&self) -> &str {
        "InjectionResultObserver"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        let metadata = match event.data.get("injection") {
            None | Some(Value::Null) => return Ok(None),
            Some(raw) => serde_json::from_value::<InjectionMetadata>(raw.clone())?,
        };
        let request_id = RequestId::from(event.require_str("request_id")?);
        match self
            .injection
            .process_result(&request_id, &event.data, &metadata, Some(event.correlation_id))
            .await
        {
            Ok(_) => Ok(None),
            // Already reported as its own event.
            Err(DomainError::CircuitBreakerTripped { chain_root, .. }) => {
                debug!(request_id = %request_id, chain_root, "injection rejected by breaker");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Resets the chain breaker when a client submits to a chain.
pub struct ExternalInputObserver {
    injection: Arc<InjectionRouter>,
}

impl ExternalInputObserver {
    pub fn new(injection: Arc<InjectionRouter>) -> Self {
        Self { injection }
    }
}

#[async_trait]
impl EventHandler for ExternalInputObserver {
    fn name(&self) -> &str {
        "ExternalInputObserver"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        if event.origin() != EventOrigin::External {
            return Ok(None);
        }
        let session = event.str_field("session_id");
        let conversation = event.str_field("conversation_id");
        if session.is_none() && conversation.is_none() {
            return Ok(None);
        }
        let root = chain_root_for(session, conversation, &RequestId::from(""));
        if self.injection.observe_external(&root) {
            debug!(chain_root = %root, "external input reset injection chain");
        }
        Ok(None)
    }
}

/// Wakes requests parked on a conversation once its lock is freed.
pub struct LockReleaseObserver {
    orchestrator: Arc<CompletionOrchestrator>,
}

impl LockReleaseObserver {
    pub fn new(orchestrator: Arc<CompletionOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl EventHandler for LockReleaseObserver {
    fn name(&self) -> &str {
        "LockReleaseObserver"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        let conversation_id = event.require_str("conversation_id")?.to_string();
        let orchestrator = Arc::clone(&self.orchestrator);
        // Off the dispatch path: the release may come from inside the orchestrator.
        tokio::spawn(async move {
            orchestrator.retry_lock_waiters(&conversation_id).await;
        });
        Ok(None)
    }
}

/// Logs every dispatched event at debug level.
pub struct EventLogObserver;

#[async_trait]
impl EventHandler for EventLogObserver {
    fn name(&self) -> &str {
        "EventLogObserver"
    }

    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>> {
        debug!(
            event = %event.name,
            correlation_id = %event.correlation_id,
            parent_correlation_id = ?event.context.parent_correlation_id,
            origin = event.origin().as_str(),
            "event dispatched"
        );
        if event.name == names::CONVERSATION_FORK_DETECTED {
            warn!(data = %event.data, "conversation fork detected");
        }
        Ok(None)
    }
}

/// Components the built-in handlers operate on.
pub struct CoreServices {
    pub router: Arc<EventRouter>,
    pub orchestrator: Arc<CompletionOrchestrator>,
    pub locks: Arc<ConversationLockManager>,
    pub injection: Arc<InjectionRouter>,
    pub trace_retention: chrono::Duration,
}

/// Register every built-in handler on `services.router`.
pub async fn register_builtin_handlers(services: &CoreServices) -> DomainResult<()> {
    let router = &services.router;

    let completion = Arc::new(CompletionCommandHandler::new(services.orchestrator.clone()));
    for name in [
        names::COMPLETION_ASYNC,
        names::COMPLETION_CANCEL,
        names::COMPLETION_STATUS,
        names::COMPLETION_SESSION_STATUS,
    ] {
        router
            .register(name, completion.clone(), priority::SYSTEM, HandlerMode::Primary)
            .await?;
    }

    let conversation = Arc::new(ConversationCommandHandler::new(services.locks.clone()));
    for name in [
        names::CONVERSATION_ACQUIRE_LOCK,
        names::CONVERSATION_RELEASE_LOCK,
        names::CONVERSATION_RENEW_LOCK,
        names::CONVERSATION_LOCK_STATUS,
    ] {
        router
            .register(name, conversation.clone(), priority::SYSTEM, HandlerMode::Primary)
            .await?;
    }

    let injection = Arc::new(InjectionCommandHandler::new(services.injection.clone()));
    for name in [
        names::INJECTION_INJECT,
        names::INJECTION_BATCH,
        names::INJECTION_CLEAR,
        names::INJECTION_LIST,
        names::INJECTION_STATUS,
    ] {
        router
            .register(name, injection.clone(), priority::SYSTEM, HandlerMode::Primary)
            .await?;
    }

    let correlation = Arc::new(CorrelationQueryHandler::new(
        router.tracer().clone(),
        services.trace_retention,
    ));
    for name in [
        names::CORRELATION_TRACE,
        names::CORRELATION_CHAIN,
        names::CORRELATION_TREE,
        names::CORRELATION_STATS,
        names::CORRELATION_CLEANUP,
    ] {
        router
            .register(name, correlation.clone(), priority::SYSTEM, HandlerMode::Primary)
            .await?;
    }

    router
        .register(
            names::SYSTEM_HEALTH,
            Arc::new(HealthHandler::new(
                router,
                services.orchestrator.clone(),
                services.locks.clone(),
            )),
            priority::SYSTEM,
            HandlerMode::Primary,
        )
        .await?;

    router
        .register(
            names::COMPLETION_RESULT,
            Arc::new(InjectionResultObserver::new(services.injection.clone())),
            priority::NORMAL,
            HandlerMode::Observer,
        )
        .await?;
    router
        .register(
            names::COMPLETION_ASYNC,
            Arc::new(ExternalInputObserver::new(services.injection.clone())),
            priority::NORMAL,
            HandlerMode::Observer,
        )
        .await?;
    let wake = Arc::new(LockReleaseObserver::new(services.orchestrator.clone()));
    for name in [
        names::CONVERSATION_LOCK_RELEASED,
        names::CONVERSATION_STALE_LOCK_RELEASED,
    ] {
        router
            .register(name, wake.clone(), priority::NORMAL, HandlerMode::Observer)
            .await?;
    }
    router
        .register("*", Arc::new(EventLogObserver), priority::LOW, HandlerMode::Observer)
        .await?;

    let count = router.handler_count().await;
    debug!(count, "registered built-in handlers");
    if count == 0 {
        warn!("no handlers registered");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::mock::{MockProvider, MockResponse};
    use crate::domain::models::{
        CompletionStatus, EventContext, InjectionConfig, LocksConfig, OrchestratorConfig, RouterConfig,
        TracerConfig,
    };
    use std::time::Duration;

    async fn core(provider: MockProvider) -> CoreServices {
        let tracer = Arc::new(CorrelationTracer::new(&TracerConfig::default()).unwrap());
        let router = Arc::new(EventRouter::new(tracer, &RouterConfig::default()));
        let locks = Arc::new(ConversationLockManager::new(LocksConfig::default()).with_router(router.clone()));
        let orchestrator = Arc::new(CompletionOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(provider),
            router.clone(),
            locks.clone(),
        ));
        let injection = Arc::new(InjectionRouter::new(InjectionConfig::default(), router.clone()));
        let services = CoreServices {
            router,
            orchestrator,
            locks,
            injection,
            trace_retention: chrono::Duration::hours(1),
        };
        register_builtin_handlers(&services).await.unwrap();
        services
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_submit_and_status_over_events() {
        let services = core(MockProvider::new()).await;
        let submitted = services
            .router
            .dispatch(
                names::COMPLETION_ASYNC,
                json!({"prompt": "hello", "session_id": "s1"}),
                EventContext::external(),
            )
            .await
            .unwrap();
        let reply = submitted.result.unwrap();
        assert_eq!(reply["status"], "dispatched");
        let request_id = reply["request_id"].as_str().unwrap().to_string();

        settle().await;
        let status = services
            .router
            .dispatch(
                names::COMPLETION_STATUS,
                json!({"request_id": request_id}),
                EventContext::external(),
            )
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(status["status"], "completed");
        assert_eq!(status["result"]["response"], "Mock completion.");
    }

    #[tokio::test]
    async fn test_validation_errors_reach_caller() {
        let services = core(MockProvider::new()).await;
        let err = services
            .router
            .dispatch(names::COMPLETION_ASYNC, json!({"prompt": ""}), EventContext::external())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");

        let err = services
            .router
            .dispatch(
                names::COMPLETION_STATUS,
                json!({"request_id": "missing"}),
                EventContext::external(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_lock_commands() {
        let services = core(MockProvider::new()).await;
        let ctx = EventContext::external;
        let a = services
            .router
            .dispatch(
                names::CONVERSATION_ACQUIRE_LOCK,
                json!({"conversation_id": "c1", "request_id": "A"}),
                ctx(),
            )
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(a["acquired"], true);

        let b = services
            .router
            .dispatch(
                names::CONVERSATION_ACQUIRE_LOCK,
                json!({"conversation_id": "c1", "request_id": "B"}),
                ctx(),
            )
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(b["acquired"], false);
        assert_eq!(b["holder"], "A");
        assert_eq!(b["error"]["kind"], "lock_conflict");

        let status = services
            .router
            .dispatch(names::CONVERSATION_LOCK_STATUS, json!({"conversation_id": "c1"}), ctx())
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(status["holder"], "A");

        services
            .router
            .dispatch(names::CONVERSATION_RELEASE_LOCK, json!({"request_id": "A"}), ctx())
            .await
            .unwrap();
        assert!(services.locks.status("c1").is_none());
    }

    #[tokio::test]
    async fn test_parked_request_wakes_on_release() {
        let services = core(MockProvider::with_default_response(
            MockResponse::success("ok").with_delay(Duration::from_millis(10)),
        ))
        .await;
        services
            .locks
            .acquire("c1", &RequestId::from("manual"), Value::Null)
            .await
            .unwrap();
        let reply = services
            .router
            .dispatch(
                names::COMPLETION_ASYNC,
                json!({"prompt": "p", "conversation_id": "c1"}),
                EventContext::external(),
            )
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(reply["status"], "queued");
        let request_id = RequestId::from(reply["request_id"].as_str().unwrap());

        services.locks.release(&RequestId::from("manual")).await;
        settle().await;
        let status = services.orchestrator.status(&request_id).unwrap().status;
        assert_ne!(status, CompletionStatus::Queued);
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let services = core(MockProvider::new()).await;
        let health = services
            .router
            .dispatch(names::SYSTEM_HEALTH, Value::Null, EventContext::external())
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert!(health["handlers"].as_u64().unwrap() > 10);
    }

    #[tokio::test]
    async fn test_correlation_chain_query() {
        let services = core(MockProvider::new()).await;
        let root = services
            .router
            .dispatch(names::SYSTEM_HEALTH, Value::Null, EventContext::external())
            .await
            .unwrap();
        let chain = services
            .router
            .dispatch(
                names::CORRELATION_CHAIN,
                json!({"correlation_id": root.correlation_id.to_string()}),
                EventContext::external(),
            )
            .await
            .unwrap()
            .result
            .unwrap();
        assert_eq!(chain["length"], 1);

        let err = services
            .router
            .dispatch(
                names::CORRELATION_TRACE,
                json!({"correlation_id": "not-a-uuid"}),
                EventContext::external(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
