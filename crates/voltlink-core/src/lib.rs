//! Resilience primitives for voltlink.
//!
//! This crate holds the two pieces of the client that own shared mutable
//! state and timing logic: the sliding-window [`RateLimiter`] consulted
//! before every outbound call, and the [`RetryingExecutor`] that runs
//! fallible operations on a background task with bounded, delayed retries.
//! Neither knows anything about the remote service it protects.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod executor;
pub mod rate_limit;

pub use error::{ExecutorError, RateLimitError};
pub use executor::{
    Completion, CompletionHistogram, ExecutorBuilder, ExecutorContext, FeedbackListener,
    LoggingListener, NoopListener, Operation, OperationResult, Request, RequestFilter,
    RetryingExecutor,
};
pub use rate_limit::{CallTimestamp, RateLimiter, RateWindowRule};
