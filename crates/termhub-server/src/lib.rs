//! termhub-server: shares live shell sessions over WebSocket.
//!
//! Clients open sessions through the events channel, then attach to a
//! session's terminal channel to drive and observe it. Any number of
//! observers may watch the same shell.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod server;
pub mod session;
pub mod transport;

pub use config::ServerConfig;
pub use server::TermhubServer;
