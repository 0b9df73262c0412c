//! Pre-submission gate port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::CompletionRequest;

/// Veto point consulted before a request enters the orchestrator.
///
/// Returning `Err(DomainError::PermissionDenied(..))` rejects the submission.
#[async_trait]
pub trait SubmissionGate: Send + Sync {
    async fn check(&self, request: &CompletionRequest) -> DomainResult<()>;
}

/// Gate that admits every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllGate;

#[async_trait]
impl SubmissionGate for AllowAllGate {
    async fn check(&self, _request: &CompletionRequest) -> DomainResult<()> {
        Ok(())
    }
}
