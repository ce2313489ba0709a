//! WebSocket server module
//!
//! Accepts chat clients, upgrades them, and runs one connection adapter per
//! client against the hub.

mod connection;
mod handshake;
mod protocol;
mod websocket;

pub use protocol::{ChatSubmission, ProtocolError, ServerMessage};
pub use websocket::ChatServer;
