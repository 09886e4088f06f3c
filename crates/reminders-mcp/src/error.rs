use thiserror::Error;

/// Boxed error type used at the tower service boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while reading from or writing to a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Errors that terminate a protocol-engine run loop.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors surfaced by session operations and the session registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session was torn down while the caller was waiting, or the caller
    /// addressed a session that is already closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session exists but its transport adapter was never connected.
    /// A caller error; the registry only hands out started sessions.
    #[error("session not started")]
    NotStarted,

    /// `start` was called twice. The adapter and engine are never swapped.
    #[error("session already started")]
    AlreadyStarted,

    /// The protocol engine's run loop terminated with an error. The session
    /// stays open; the client decides whether to retry or close.
    #[error("protocol engine failed: {0}")]
    Engine(String),

    /// No session matched the supplied token.
    #[error("session not found")]
    NotFound,
}
