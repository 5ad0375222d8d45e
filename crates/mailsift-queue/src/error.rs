//! Queue error types

use thiserror::Error;

/// Errors returned by work queue backends
#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue was closed; no further items will be delivered
    #[error("queue closed")]
    Closed,

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("circuit breaker open, publishing suspended")]
    CircuitOpen,

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for queue operations
pub type QueueResult<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Whether this error is the cancellation outcome rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

impl From<mailsift_common::Error> for QueueError {
    fn from(e: mailsift_common::Error) -> Self {
        match e {
            mailsift_common::Error::Config(msg) => QueueError::Config(msg),
            other => QueueError::Serialization(other.to_string()),
        }
    }
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Broker(e.to_string())
    }
}
