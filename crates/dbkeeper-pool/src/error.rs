//! Error types for the connection pool.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`ConnectionPool`](crate::ConnectionPool) operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PoolError {
    /// The pool stayed saturated for the whole wait. Callers may retry.
    #[error("timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    /// A queued acquire was rejected because the pool is being shut down.
    #[error("connection pool is shutting down")]
    ShuttingDown,

    #[error("connection pool is closed")]
    Closed,

    #[error("connection pool is already initialized")]
    AlreadyInitialized,

    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    /// Release or I/O on a handle that is not checked out.
    #[error("connection {0} is not checked out")]
    NotBusy(u64),

    #[error("failed to open connection: {0}")]
    Connect(String),

    #[error("connection {handle}: {message}")]
    Io { handle: u64, message: String },
}

impl PoolError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Timeout(_) | PoolError::Connect(_))
    }
}
