//! Error types for the rate limiter.

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A call argument or limit failed validation. Raised before the store
    /// is contacted.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backing store failed or answered with something unusable. The
    /// outcome of the call is unknown.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error was raised by input validation.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// Whether this error came from the store adapter.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Store(_))
    }
}

/// Errors produced by a [`StoreAdapter`](crate::store::StoreAdapter).
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transport or server-side failure from Redis.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store replied with the wrong shape or a non-numeric field.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// A script was invoked with arguments it cannot decode.
    #[error("bad script arguments: {0}")]
    ScriptArguments(String),

    /// A connection pool needs at least one connection.
    #[error("invalid pool size {0}: must be > 0")]
    InvalidPoolSize(usize),

    /// The adapter was closed.
    #[error("store is closed")]
    Closed,

    /// The adapter does not know how to run this command.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, Error>;
