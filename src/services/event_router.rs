//! Event router.
//!
//! Handlers register against name patterns with a priority and a mode.
//! Primary handlers are tried in priority order until one produces a
//! result; observers see every matching event and can never change the
//! result. Every handler invocation is isolated: errors, panics and
//! timeouts are logged with the event's correlation id and the dispatch
//! carries on with the next handler.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, warn};

use super::correlation_tracer::CorrelationTracer;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    validate_event_name, CorrelationId, Event, EventContext, RouterConfig, TraceOutcome,
};

/// Whether a handler answers an event or only watches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    Primary,
    Observer,
}

/// Handler priorities (higher runs first).
pub mod priority {
    pub const SYSTEM: i32 = 1000;
    pub const HIGH: i32 = 100;
    pub const NORMAL: i32 = 0;
    pub const LOW: i32 = -100;
}

/// A `namespace:action` pattern.
///
/// Each segment is matched separately and may contain `*` globs. A final
/// segment of exactly `*` matches one or more remaining segments, so
/// `completion:*` matches `completion:result` and `*` matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPattern {
    raw: String,
    segments: Vec<String>,
}

impl EventPattern {
    pub fn parse(pattern: &str) -> DomainResult<Self> {
        validate_event_name(pattern)?;
        Ok(Self {
            raw: pattern.to_string(),
            segments: pattern.split(':').map(str::to_string).collect(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split(':').collect();
        let last = self.segments.len() - 1;
        for (i, segment) in self.segments.iter().enumerate() {
            if i == last && segment == "*" {
                return parts.len() > i;
            }
            match parts.get(i) {
                Some(part) if glob_match(segment, part) => {}
                _ => return false,
            }
        }
        parts.len() == self.segments.len()
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Trait for event handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name used in logs.
    fn name(&self) -> &str;

    /// Handle an event. `Ok(None)` means "no result"; the router moves on.
    async fn handle(&self, event: &Event) -> DomainResult<Option<Value>>;
}

struct Registration {
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
    priority: i32,
    mode: HandlerMode,
    seq: u64,
}

/// Outcome of a dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub correlation_id: CorrelationId,
    /// Result of the first primary handler that produced one.
    pub result: Option<Value>,
    pub handled_by: Option<String>,
}

/// Central dispatch table.
pub struct EventRouter {
    registrations: RwLock<Vec<Arc<Registration>>>,
    tracer: Arc<CorrelationTracer>,
    sender: broadcast::Sender<Arc<Event>>,
    handler_timeout: Duration,
    next_seq: AtomicU64,
    dispatched: AtomicU64,
}

impl EventRouter {
    pub fn new(tracer: Arc<CorrelationTracer>, config: &RouterConfig) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        Self {
            registrations: RwLock::new(Vec::new()),
            tracer,
            sender,
            handler_timeout: Duration::from_millis(config.handler_timeout_ms),
            next_seq: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn tracer(&self) -> &Arc<CorrelationTracer> {
        &self.tracer
    }

    /// Register a handler for events matching `pattern`.
    pub async fn register(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
        priority: i32,
        mode: HandlerMode,
    ) -> DomainResult<()> {
        let pattern = EventPattern::parse(pattern)?;
        debug!(
            handler = handler.name(),
            pattern = pattern.as_str(),
            priority,
            mode = ?mode,
            "registered event handler"
        );
        let registration = Registration {
            pattern,
            handler,
            priority,
            mode,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        self.registrations.write().await.push(Arc::new(registration));
        Ok(())
    }

    pub async fn handler_count(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn handler_names(&self) -> Vec<String> {
        self.registrations
            .read()
            .await
            .iter()
            .map(|r| format!("{} ({})", r.handler.name(), r.pattern.as_str()))
            .collect()
    }

    /// Receive every dispatched event.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Dispatch an event to every matching handler.
    ///
    /// Returns the first primary result. When no primary produced one, the
    /// first caller-facing error raised by a primary is returned instead;
    /// otherwise the result is empty.
    pub async fn dispatch(
        &self,
        name: &str,
        data: Value,
        context: EventContext,
    ) -> DomainResult<DispatchResult> {
        validate_event_name(name)?;
        let data = match data {
            Value::Null => Value::Object(serde_json::Map::new()),
            Value::Object(_) => data,
            _ => {
                return Err(DomainError::ValidationFailed(format!(
                    "{name}: data must be a JSON object"
                )))
            }
        };

        let started = Instant::now();
        let correlation_id = self.tracer.start_trace(
            name,
            context.parent_correlation_id,
            context.correlation_id,
            &data,
        );
        let event = Arc::new(Event {
            name: name.to_string(),
            data,
            context,
            correlation_id,
            timestamp: Utc::now(),
        });
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.sender.send(Arc::clone(&event));

        let (mut primaries, observers): (Vec<_>, Vec<_>) = self
            .registrations
            .read()
            .await
            .iter()
            .filter(|r| r.pattern.matches(name))
            .cloned()
            .partition(|r| r.mode == HandlerMode::Primary);
        primaries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

        let observer_runs = join_all(observers.iter().map(|r| self.invoke(r, &event)));
        let ((result, handled_by, caller_error, primary_failed), observer_results) =
            tokio::join!(self.run_primaries(&primaries, &event), observer_runs);
        let observer_failed = observer_results.iter().any(Result::is_err);

        let outcome = if primary_failed || observer_failed {
            TraceOutcome::Failed
        } else if result.is_some() {
            TraceOutcome::Handled
        } else {
            TraceOutcome::Unhandled
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.tracer.record(correlation_id, outcome, elapsed);

        if result.is_none() {
            if let Some(err) = caller_error {
                return Err(err);
            }
        }
        Ok(DispatchResult {
            correlation_id,
            result,
            handled_by,
        })
    }

    /// Dispatch an internally produced event, logging instead of returning failures.
    pub async fn emit(&self, name: &str, data: Value, context: EventContext) -> Option<CorrelationId> {
        match self.dispatch(name, data, context).await {
            Ok(outcome) => Some(outcome.correlation_id),
            Err(e) => {
                warn!(event = name, error = %e, "failed to emit event");
                None
            }
        }
    }

    async fn run_primaries(
        &self,
        primaries: &[Arc<Registration>],
        event: &Event,
    ) -> (Option<Value>, Option<String>, Option<DomainError>, bool) {
        let mut caller_error = None;
        let mut failed = false;
        for registration in primaries {
            match self.invoke(registration, event).await {
                Ok(Some(value)) if !value.is_null() => {
                    return (
                        Some(value),
                        Some(registration.handler.name().to_string()),
                        caller_error,
                        failed,
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_caller_facing() => {
                    if caller_error.is_none() {
                        caller_error = Some(e);
                    }
                }
                Err(_) => failed = true,
            }
        }
        (None, None, caller_error, failed)
    }

    async fn invoke(&self, registration: &Registration, event: &Event) -> DomainResult<Option<Value>> {
        let handler = registration.handler.name();
        let call = AssertUnwindSafe(registration.handler.handle(event)).catch_unwind();
        match tokio::time::timeout(self.handler_timeout, call).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => {
                if e.is_caller_facing() {
                    debug!(handler, event = %event.name, correlation_id = %event.correlation_id, error = %e, "handler rejected event");
                } else {
                    warn!(handler, event = %event.name, correlation_id = %event.correlation_id, error = %e, "handler failed");
                }
                Err(e)
            }
            Ok(Err(panic)) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(handler, event = %event.name, correlation_id = %event.correlation_id, panic = %message, "handler panicked");
                Err(DomainError::Internal(format!("handler '{handler}' panicked: {message}")))
            }
            Err(_) => {
                let after_ms = u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(handler, event = %event.name, correlation_id = %event.correlation_id, after_ms, "handler timed out");
                Err(DomainError::Timeout { after_ms })
            }
        }
    }
}
