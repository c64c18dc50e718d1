//! Error types for the queue core

use serde::{Deserialize, Serialize};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for queue operations
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    /// Any Redis-level failure. Surfaced to the caller of the affected
    /// operation and never retried by the core.
    #[error("storage error: {0}")]
    Storage(String),

    /// No record exists for the given job id (or the stored record belongs
    /// to a different id).
    #[error("job not found: {0}")]
    NotFound(String),

    /// The stored record could not be deserialized.
    #[error("corrupt job record: {0}")]
    Corrupt(String),

    /// A blocking pop returned no job within its timeout. Non-fatal; the
    /// worker loop re-pops.
    #[error("no job available within the pop timeout")]
    Empty,

    /// Invalid caller inputs, raised synchronously at construction.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// A record failed to serialize on the write path.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Check whether this error is the non-fatal empty-pop signal.
    pub fn is_empty_pop(&self) -> bool {
        matches!(self, Error::Empty)
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Storage(err.to_string())
    }
}
