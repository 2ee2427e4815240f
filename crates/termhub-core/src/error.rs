use thiserror::Error;

/// Errors produced by the termhub protocol and server layers.
#[derive(Debug, Error)]
pub enum TermhubError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("capacity reached: {0}")]
    CapacityReached(String),

    #[error("path rejected: {0}")]
    PathRejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TermhubResult<T> = Result<T, TermhubError>;
