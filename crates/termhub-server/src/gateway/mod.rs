//! Gateway: the per-connection endpoints behind the WebSocket listener.
//!
//! # Submodule Architecture
//!
//! - **[`terminal`]**: one connection per session observer. Authenticates,
//!   resolves the session by id, attaches, replays history, then relays
//!   shell output out and `input` / `resize` messages in.
//!
//! - **[`events`]**: registry-scoped channel. Sends the session list once
//!   (`init`), then streams `create` / `kill` events, and answers
//!   management requests (`create`, `kill`, `list`, `session_key`).
//!
//! Both endpoints authenticate the same way and refuse with close code 4003
//! before touching any session state.
//!
//! # Data Flow
//!
//! ```text
//! WebSocketConnection
//!   → TermhubServer::dispatch (server.rs, by request path)
//!     → terminal::serve   /terminal/{id}
//!         → Authenticator::authenticate   (4003 on failure)
//!         → SessionRegistry::get_session  (4004 when absent)
//!         → TerminalSession::attach → replay → relay loop → detach
//!     → events::serve     /events
//!         → Authenticator::authenticate
//!         → SessionRegistry::subscribe → init → event / control loop
//! ```

pub mod events;
pub mod terminal;

use crate::auth::Credentials;
use crate::transport::UpgradeRequest;

/// Close code for a session that ended while observed.
pub const CLOSE_NORMAL: u16 = 1000;

/// Credentials carried by an upgrade request.
pub(crate) fn credentials(request: &UpgradeRequest) -> Credentials {
    Credentials::new(
        request.param("key").map(str::to_string),
        request.param("token").map(str::to_string),
        request.token_header.clone(),
    )
}
