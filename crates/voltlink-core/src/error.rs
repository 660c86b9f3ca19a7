//! Error types for the resilience primitives.

use thiserror::Error;

use crate::executor::Request;

/// Errors raised while configuring a [`RateLimiter`](crate::RateLimiter).
///
/// Throttling itself never fails; it only delays.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// A window rule with a zero count or a zero-length window.
    #[error("invalid rate rule: {max_count} calls per {window_secs}s")]
    InvalidRule { max_count: usize, window_secs: u64 },

    /// A rule asks for more history than the call log can hold.
    #[error("call log capacity {capacity} cannot evaluate a rule of {max_count} calls")]
    CapacityTooSmall { capacity: usize, max_count: usize },

    #[error("call log capacity must be at least 1")]
    EmptyCallLog,
}

/// Errors raised when handing a [`Request`] to a
/// [`RetryingExecutor`](crate::RetryingExecutor).
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The executor has been shut down and accepts no more work.
    #[error("executor {name} is shutting down")]
    ShuttingDown { name: String },

    /// The queue stayed full for the whole submit timeout. The request is
    /// handed back so the caller can decide what to do with it.
    #[error("executor {name} queue stayed full; request {} not enqueued", request.name())]
    QueueFull { name: String, request: Box<Request> },
}

impl ExecutorError {
    /// Returns `true` when the failure came from shutdown rather than load.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown { .. })
    }
}
