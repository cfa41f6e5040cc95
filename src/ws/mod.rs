//! WebSocket transport: wire protocol, connection handles, socket sessions

pub mod connection;
pub mod handler;
pub mod protocol;
