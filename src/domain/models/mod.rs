pub mod completion;
pub mod config;
pub mod conversation;
pub mod event;
pub mod injection;
pub mod session_queue;
pub mod trace;

pub use completion::{
    chain_root_for, ChainInfo, CompletionRequest, CompletionResult, CompletionStatus,
    FailureReason, RequestId, RequestPriority, SubmitParams,
};
pub use config::{
    Config, DaemonConfig, InjectionConfig, LocksConfig, LoggingConfig, MaintenanceConfig,
    OrchestratorConfig, ProviderConfig, RouterConfig, TracerConfig,
};
pub use conversation::{ConversationLock, LockOutcome, RotationRecord, TurnOutcome};
pub use event::{names, validate_event_name, CorrelationId, Event, EventContext, EventOrigin};
pub use injection::{merge_contents, InjectionEntry, InjectionMetadata, InjectionMode};
pub use session_queue::SessionQueue;
pub use trace::{TraceNode, TraceOutcome, TraceStats, TraceTree};
