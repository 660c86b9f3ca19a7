//! Progress callbacks emitted by the executor worker.

use std::fmt;

use super::histogram::CompletionHistogram;
use super::request::Request;

/// Receives progress from a [`RetryingExecutor`](super::RetryingExecutor).
///
/// Callbacks run on the worker task, so implementations should return
/// quickly.
pub trait FeedbackListener: Send + Sync + fmt::Debug {
    /// An attempt of `request` is about to run.
    fn on_started(&self, request: &Request);

    /// An attempt of `request` finished. Called once per attempt, so a
    /// request that is retried reports several completions.
    fn on_completed(&self, request: &Request, succeeded: bool);

    /// Periodic report of the full histogram, keyed by the display name of
    /// the request whose completion triggered it.
    fn on_histogram(&self, name: &str, histogram: &CompletionHistogram);
}

/// Listener that writes progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl FeedbackListener for LoggingListener {
    fn on_started(&self, request: &Request) {
        log::debug!("{}: attempt {} started", request.name(), request.retries() + 1);
    }

    fn on_completed(&self, request: &Request, succeeded: bool) {
        if succeeded {
            log::debug!("{}: attempt {} succeeded", request.name(), request.retries() + 1);
        } else {
            log::debug!("{}: attempt {} failed", request.name(), request.retries() + 1);
        }
    }

    fn on_histogram(&self, name: &str, histogram: &CompletionHistogram) {
        log::info!("{} completion histogram: {}", name, histogram);
    }
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl FeedbackListener for NoopListener {
    fn on_started(&self, _request: &Request) {}

    fn on_completed(&self, _request: &Request, _succeeded: bool) {}

    fn on_histogram(&self, _name: &str, _histogram: &CompletionHistogram) {}
}
