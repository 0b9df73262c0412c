//! Domain layer for the switchyard coordination daemon
//!
//! Pure models, the error taxonomy, and the ports implemented by adapters.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
