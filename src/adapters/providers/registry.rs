//! Provider registry and factory.

use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::ProviderConfig;
use crate::domain::ports::CompletionProvider;

use super::claude_cli::{ClaudeCliConfig, ClaudeCliProvider};
use super::mock::MockProvider;

/// Provider kinds accepted in configuration.
pub const AVAILABLE_PROVIDERS: &[&str] = &["claude_cli", "mock"];

/// Create the provider named by `config.kind`.
pub fn create_provider(config: &ProviderConfig) -> DomainResult<Arc<dyn CompletionProvider>> {
    match config.kind.as_str() {
        "claude_cli" => Ok(Arc::new(ClaudeCliProvider::new(ClaudeCliConfig::from(config)))),
        "mock" => Ok(Arc::new(MockProvider::new())),
        other => Err(DomainError::ValidationFailed(format!(
            "unknown provider kind '{other}' (expected one of: {})",
            AVAILABLE_PROVIDERS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: &str) -> ProviderConfig {
        ProviderConfig {
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_by_kind() {
        assert_eq!(create_provider(&config("claude_cli")).unwrap().name(), "claude_cli");
        assert_eq!(create_provider(&config("mock")).unwrap().name(), "mock");
    }

    #[test]
    fn test_unknown_kind() {
        let err = create_provider(&config("carrier-pigeon")).err().unwrap();
        assert_eq!(err.kind(), "validation_error");
    }
}
