pub mod builtin_handlers;
pub mod circuit_breaker;
pub mod completion_orchestrator;
pub mod conversation_locks;
pub mod correlation_tracer;
pub mod event_router;
pub mod injection_router;
pub mod maintenance_daemon;

pub use builtin_handlers::{register_builtin_handlers, CoreServices};
pub use circuit_breaker::{BreakerCheck, ChainCircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use completion_orchestrator::{CompletionOrchestrator, OrchestratorStats, SessionStatus};
pub use conversation_locks::ConversationLockManager;
pub use correlation_tracer::{CorrelationTracer, PayloadSanitizer};
pub use event_router::{priority, DispatchResult, EventHandler, EventPattern, EventRouter, HandlerMode};
pub use injection_router::{InjectionOutcome, InjectionRouter, ManualInjection};
pub use maintenance_daemon::{DaemonHandle, MaintenanceDaemon, MaintenanceDaemonConfig, MaintenanceReport};
