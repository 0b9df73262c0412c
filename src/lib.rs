//! Switchyard - event routing and completion coordination daemon
//!
//! Switchyard accepts events from clients over a Unix socket, routes them
//! to handlers by name pattern, serializes language-model completions per
//! session, guards conversations with expiring locks, and feeds completion
//! results back in as new requests behind a chain circuit breaker.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, the error taxonomy and ports
//! - **Service Layer** (`services`): router, orchestrator, locks, injection, tracer
//! - **Adapters** (`adapters`): completion providers and the socket transport
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **Application Layer** (`application`): daemon wiring and lifecycle
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use switchyard::{application::Daemon, ConfigLoader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let daemon = Daemon::new(ConfigLoader::load()?).await?;
//!     daemon.run().await
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::Daemon;
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    CompletionRequest, CompletionStatus, Config, CorrelationId, Event, EventContext, EventOrigin,
    RequestId,
};
pub use domain::ports::{CompletionProvider, SubmissionGate};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CompletionOrchestrator, ConversationLockManager, CorrelationTracer, EventRouter,
    InjectionRouter,
};
