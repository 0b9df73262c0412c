//! Unix domain socket transport.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::SocketClient;
pub use protocol::{WireError, WireRequest, WireResponse};
pub use server::SocketServer;
