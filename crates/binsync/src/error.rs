//! Error types for the replication pipeline.
//!
//! A single crate-wide error enum with retriability classification so the
//! slave engine and the workers can decide between reconnecting and bailing.

use thiserror::Error;

/// Errors produced by the codec, the wire protocol, the binlog decoder and
/// the worker pipeline.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A read ran past the end of the current packet or event body.
    #[error("binary data overflow")]
    Overflow,

    /// Malformed packet or event body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake or authentication failure. Never retried.
    #[error("authentication error: {0}")]
    Auth(String),

    /// An ERR packet from the server, surfaced verbatim.
    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    /// Underlying socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Read deadline exceeded (missed heartbeat counts as this).
    #[error("timeout: {0}")]
    Timeout(String),

    /// The peer closed the connection or a channel endpoint was dropped.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration, detected before the engine starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Table metadata mismatch or missing table map / format description.
    #[error("schema error: {0}")]
    Schema(String),

    /// Conflicting or invalid sync rule.
    #[error("rule error: {0}")]
    Rule(String),

    /// Destination database failure.
    #[error("executor error: {0}")]
    Executor(#[from] mysql_async::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The user cancelled the engine. Terminal but clean.
    #[error("user closed")]
    UserClosed,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SyncError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn rule(msg: impl Into<String>) -> Self {
        Self::Rule(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether a reconnect attempt may succeed.
    ///
    /// Connection I/O and timeouts are transient; authentication failures,
    /// configuration problems and user cancellation are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::ConnectionClosed => true,
            Self::Executor(_) => true,
            Self::Overflow
            | Self::Protocol(_)
            | Self::Auth(_)
            | Self::Server { .. }
            | Self::Config(_)
            | Self::Schema(_)
            | Self::Rule(_)
            | Self::Json(_)
            | Self::UserClosed
            | Self::InvalidState(_) => false,
        }
    }
}

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
