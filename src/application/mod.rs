//! Application layer: the daemon that wires every service together.

pub mod daemon;

pub use daemon::Daemon;
