//! Adapters for the provider backends and the client transport.

pub mod providers;
pub mod socket;
