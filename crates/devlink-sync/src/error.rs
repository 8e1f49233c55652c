use std::time::Duration;

/// Errors returned by [`RefSemaphore`](crate::RefSemaphore) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// An argument was outside the accepted range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The semaphore is being destroyed or has been destroyed.
    #[error("semaphore is {0}")]
    InvalidState(&'static str),

    /// The wait deadline elapsed before a signal was consumed.
    #[error("wait timed out after {0:?}")]
    Timeout(Duration),

    /// The waiter was released by [`cancel_waiters`](crate::RefSemaphore::cancel_waiters).
    #[error("wait cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SyncError>;
