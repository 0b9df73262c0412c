//! Completion provider port - interface for the external language-model backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::errors::DomainResult;
use crate::domain::models::RequestId;

/// Input to a single provider call.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub request_id: RequestId,
    /// Already-rendered prompt payload, treated as opaque.
    pub prompt: Value,
    /// Conversation to continue; `None` starts a new one.
    pub conversation_id: Option<String>,
    pub model: Option<String>,
    pub deadline: DateTime<Utc>,
}

/// Output of a successful provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub response: Value,
    /// Conversation id after this turn; may differ from the one supplied.
    pub conversation_id: Option<String>,
    pub usage: Option<Value>,
}

impl ProviderResponse {
    pub fn new(response: Value) -> Self {
        Self {
            response,
            conversation_id: None,
            usage: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Trait for completion provider implementations.
///
/// The orchestrator bounds every call with a deadline and may drop the
/// returned future to abort it. Implementations that cannot be interrupted
/// must return `false` from `supports_abort`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider type name.
    fn name(&self) -> &'static str;

    /// Whether dropping an in-flight `invoke` future actually stops the work.
    fn supports_abort(&self) -> bool {
        true
    }

    /// Run one completion. Intermediate progress may be sent on `progress`.
    async fn invoke(
        &self,
        request: ProviderRequest,
        progress: mpsc::Sender<Value>,
    ) -> DomainResult<ProviderResponse>;
}
