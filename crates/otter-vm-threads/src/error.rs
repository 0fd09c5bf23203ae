//! Thread coordination errors
//!
//! Only recoverable, caller-visible failures live here. Broken invariants
//! (bad transitions, lock-order violations, negative barriers) are fatal
//! and never come back as a `Result`.

use crate::thread::ThreadId;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the coordination context
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThreadError {
    /// A thread tried to raise its own suspend count
    #[error("a thread cannot request its own suspension")]
    SelfSuspend,

    /// Target thread is not (or no longer) registered
    #[error("thread {0} is not registered")]
    NotRegistered(ThreadId),

    /// Resume requested for a thread that holds no suspend count
    #[error("thread {0} is not suspended")]
    NotSuspended(ThreadId),

    /// Registration after shutdown
    #[error("thread list is shut down")]
    ShutDown,

    /// Thread id space exhausted
    #[error("too many threads (limit {0})")]
    TooManyThreads(u32),

    /// A suspend barrier did not reach zero in time
    #[error("timed out after {waited:?} waiting for thread {thread} to suspend")]
    SuspendTimeout { thread: ThreadId, waited: Duration },

    /// Suspension retries exhausted
    #[error("gave up suspending thread {thread} after {retries} retries")]
    SuspendRetriesExhausted { thread: ThreadId, retries: u32 },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ThreadError {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for thread coordination operations
pub type ThreadResult<T> = std::result::Result<T, ThreadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ThreadError::SelfSuspend.to_string(),
            "a thread cannot request its own suspension"
        );
        assert_eq!(
            ThreadError::NotSuspended(ThreadId::from_raw(3)).to_string(),
            "thread 3 is not suspended"
        );
        assert_eq!(
            ThreadError::internal("boom").to_string(),
            "internal error: boom"
        );
    }
}
