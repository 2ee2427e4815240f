//! termhub-core: Shared protocol library for termhub.
//!
//! Provides the JSON message types spoken on terminal and events channels,
//! the close codes used to refuse connections, and the common error type.

pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{TermhubError, TermhubResult};
pub use messages::{
    ClientMessage, ControlMessage, ServerMessage, SessionSummary, CLOSE_AUTH_FAILED,
    CLOSE_SESSION_NOT_FOUND, DEFAULT_COLS, DEFAULT_ROWS,
};
