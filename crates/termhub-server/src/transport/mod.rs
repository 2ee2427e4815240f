//! Network transport: WebSocket over TCP, optionally wrapped in TLS.

pub mod tls;
pub mod websocket;

pub use websocket::{start_listener, Listener, UpgradeRequest, WebSocketConnection, WsStream};
