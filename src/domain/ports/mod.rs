//! Port trait definitions (Hexagonal Architecture)
//!
//! - CompletionProvider: the external language-model backend
//! - SubmissionGate: permission check before a request is admitted

pub mod completion_provider;
pub mod submission_gate;

pub use completion_provider::{CompletionProvider, ProviderRequest, ProviderResponse};
pub use submission_gate::{AllowAllGate, SubmissionGate};
