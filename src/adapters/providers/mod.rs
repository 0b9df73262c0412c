//! Completion provider adapters.

pub mod claude_cli;
pub mod mock;
pub mod registry;

pub use claude_cli::{ClaudeCliConfig, ClaudeCliProvider};
pub use mock::{MockInvocation, MockProvider, MockResponse};
pub use registry::{create_provider, AVAILABLE_PROVIDERS};
