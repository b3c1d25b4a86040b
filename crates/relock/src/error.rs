//! Error types for lock operations.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Malformed configuration or options, detected before any network action
    #[error("invalid `{field}`: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },

    /// Operation attempted after shutdown
    #[error("this instance has been closed")]
    Closed,

    /// A concrete strategy did not supply a required primitive.
    /// This is a programmer error, not a runtime condition to recover from.
    #[error("unimplemented method `{0}` is required by the strategy contract")]
    Unimplemented(&'static str),

    /// Acquire deadline elapsed without an observed committed grant
    #[error("the lock could not be granted in time")]
    AcquireTimeout,

    /// Release deadline elapsed without a successful proposal round
    #[error("the lock could not be released in time")]
    ReleaseTimeout,

    /// Release was called with a lock minted by a different strategy family
    #[error("release() expects a lock returned by acquire() on this strategy")]
    ForeignLock,

    /// Backend error (engine, store, network, etc.)
    #[error("backend error: {0}")]
    Backend(String),
}

impl LockError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        LockError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(format!("redis error: {}", err))
    }
}
