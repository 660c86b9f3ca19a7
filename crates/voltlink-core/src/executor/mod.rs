//! Background executor with bounded, delayed retries.
//!
//! A [`RetryingExecutor`] owns one worker task that drains a bounded FIFO
//! queue of [`Request`]s. Each request's [`Operation`] is run; a failed
//! attempt is re-submitted to the back of the queue after the request's
//! retry delay until its retry budget is spent. Terminal outcomes are
//! tallied in a [`CompletionHistogram`] that is reported to the
//! [`FeedbackListener`] every [`HISTOGRAM_REPORT_INTERVAL`] completions.
//!
//! All shared state lives in an explicitly constructed [`ExecutorContext`]:
//! the queue's sending half, the histogram and the shutdown token.

mod histogram;
mod listener;
mod request;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutorError;

pub use histogram::{Completion, CompletionHistogram};
pub use listener::{FeedbackListener, LoggingListener, NoopListener};
pub use request::{Operation, OperationResult, Request, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY};

/// Queue slots available before `submit` starts waiting.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20;

/// How long `submit` waits for a free slot before handing the request back.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// The histogram is reported after every this many completions.
pub const HISTOGRAM_REPORT_INTERVAL: u64 = 10;

/// Hook run on every request before it enters the queue, retries included.
/// Returning `None` drops the request; returning a different request
/// replaces it.
pub type RequestFilter = Arc<dyn Fn(Request) -> Option<Request> + Send + Sync>;

/// Shared state of one executor.
pub struct ExecutorContext {
    name: String,
    queue: mpsc::Sender<Request>,
    histogram: Mutex<CompletionHistogram>,
    shutdown: CancellationToken,
    listener: Arc<dyn FeedbackListener>,
    filter: Option<RequestFilter>,
    submit_timeout: Option<Duration>,
}

impl ExecutorContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token that stops the worker and any pending retries when cancelled.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Snapshot of the completion histogram.
    pub fn histogram(&self) -> CompletionHistogram {
        self.histogram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enqueue a request, waiting at most the configured submit timeout for
    /// a free slot.
    pub async fn submit(&self, request: Request) -> Result<(), ExecutorError> {
        self.enqueue(request, self.submit_timeout).await
    }

    async fn enqueue(
        &self,
        request: Request,
        timeout: Option<Duration>,
    ) -> Result<(), ExecutorError> {
        if self.shutdown.is_cancelled() {
            return Err(self.shutting_down());
        }

        let request = match &self.filter {
            Some(filter) => match filter(request) {
                Some(request) => request,
                None => {
                    log::debug!("{}: request filtered out before enqueue", self.name);
                    return Ok(());
                }
            },
            None => request,
        };

        let Some(timeout) = timeout else {
            return tokio::select! {
                () = self.shutdown.cancelled() => Err(self.shutting_down()),
                sent = self.queue.send(request) => sent.map_err(|_| self.shutting_down()),
            };
        };

        tokio::select! {
            () = self.shutdown.cancelled() => Err(self.shutting_down()),
            sent = self.queue.send_timeout(request, timeout) => match sent {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(request)) => Err(ExecutorError::QueueFull {
                    name: self.name.clone(),
                    request: Box::new(request),
                }),
                Err(SendTimeoutError::Closed(_)) => Err(self.shutting_down()),
            },
        }
    }

    fn shutting_down(&self) -> ExecutorError {
        ExecutorError::ShuttingDown {
            name: self.name.clone(),
        }
    }

    fn record(&self, request: &Request, completion: Completion) {
        let report = {
            let mut histogram = self
                .histogram
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            histogram.record(completion);
            (histogram.total() % HISTOGRAM_REPORT_INTERVAL == 0).then(|| histogram.clone())
        };
        if let Some(histogram) = report {
            self.listener.on_histogram(request.name(), &histogram);
        }
    }

    /// Re-submit `request` after its retry delay without blocking the
    /// worker. Shutdown abandons the pending retry.
    fn schedule_retry(self: &Arc<Self>, request: Request) {
        let context = Arc::clone(self);
        let delay = request.retry_delay();
        tokio::spawn(async move {
            tokio::select! {
                () = context.shutdown.cancelled() => {}
                () = sleep(delay) => {
                    let name = request.name().to_string();
                    if let Err(e) = context.enqueue(request, None).await {
                        log::debug!("{}: retry of {} dropped: {}", context.name, name, e);
                    }
                }
            }
        });
    }
}

impl fmt::Debug for ExecutorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorContext")
            .field("name", &self.name)
            .field("shutting_down", &self.shutdown.is_cancelled())
            .field("listener", &self.listener)
            .field("submit_timeout", &self.submit_timeout)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`RetryingExecutor`].
#[derive(Debug)]
pub struct ExecutorBuilder {
    name: String,
    listener: Arc<dyn FeedbackListener>,
    queue_capacity: usize,
    submit_timeout: Option<Duration>,
    shutdown: Option<CancellationToken>,
    filter: Option<FilterDebug>,
}

/// Wrapper so the builder stays `Debug` while holding a closure.
struct FilterDebug(RequestFilter);

impl fmt::Debug for FilterDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestFilter")
    }
}

impl ExecutorBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listener: Arc::new(LoggingListener),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            submit_timeout: Some(DEFAULT_SUBMIT_TIMEOUT),
            shutdown: None,
            filter: None,
        }
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn FeedbackListener>) -> Self {
        self.listener = listener;
        self
    }

    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// `None` makes `submit` wait for a slot until shutdown.
    #[must_use]
    pub fn submit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Tie the executor to a process-wide shutdown token. The executor
    /// uses a child token, so shutting it down alone leaves the parent live.
    #[must_use]
    pub fn shutdown(mut self, token: &CancellationToken) -> Self {
        self.shutdown = Some(token.child_token());
        self
    }

    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Request) -> Option<Request> + Send + Sync + 'static,
    {
        self.filter = Some(FilterDebug(Arc::new(filter)));
        self
    }

    /// Create the context and spawn the worker. Must be called from
    /// within a tokio runtime.
    pub fn spawn(self) -> RetryingExecutor {
        let (queue, receiver) = mpsc::channel(self.queue_capacity);
        let context = Arc::new(ExecutorContext {
            name: self.name,
            queue,
            histogram: Mutex::new(CompletionHistogram::new()),
            shutdown: self.shutdown.unwrap_or_default(),
            listener: self.listener,
            filter: self.filter.map(|f| f.0),
            submit_timeout: self.submit_timeout,
        });
        let worker = tokio::spawn(run_worker(Arc::clone(&context), receiver));
        RetryingExecutor {
            context,
            worker: Some(worker),
        }
    }
}

/// Handle to a running executor. Dropping it shuts the worker down.
#[derive(Debug)]
pub struct RetryingExecutor {
    context: Arc<ExecutorContext>,
    worker: Option<JoinHandle<()>>,
}

impl RetryingExecutor {
    pub fn builder(name: impl Into<String>) -> ExecutorBuilder {
        ExecutorBuilder::new(name)
    }

    /// Spawn an executor with default settings and the given listener.
    pub fn spawn(name: impl Into<String>, listener: Arc<dyn FeedbackListener>) -> Self {
        Self::builder(name).listener(listener).spawn()
    }

    pub fn context(&self) -> &Arc<ExecutorContext> {
        &self.context
    }

    pub async fn submit(&self, request: Request) -> Result<(), ExecutorError> {
        self.context.submit(request).await
    }

    pub fn histogram(&self) -> CompletionHistogram {
        self.context.histogram()
    }

    /// Stop the worker and wait for it to exit. Queued requests and
    /// pending retries are abandoned.
    pub async fn shutdown(mut self) {
        self.context.shutdown.cancel();
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::warn!("{} worker ended abnormally: {}", self.context.name, e);
            }
        }
    }
}

impl Drop for RetryingExecutor {
    fn drop(&mut self) {
        self.context.shutdown.cancel();
    }
}

async fn run_worker(context: Arc<ExecutorContext>, mut queue: mpsc::Receiver<Request>) {
    let shutdown = context.shutdown.clone();
    log::debug!("{} worker started", context.name);

    loop {
        let mut request = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let operation = Arc::clone(request.operation());
        if operation.is_superseded().await {
            log::debug!("{}: {} superseded, skipping", context.name, request.name());
            continue;
        }

        context.listener.on_started(&request);
        let attempt = AssertUnwindSafe(operation.execute()).catch_unwind();
        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            outcome = attempt => outcome,
        };
        let succeeded = match outcome {
            Ok(Ok(succeeded)) => succeeded,
            Ok(Err(e)) => {
                log::warn!("Exception in {}: {}: {}", context.name, request.name(), e);
                false
            }
            Err(_) => {
                log::error!("{}: {} panicked", context.name, request.name());
                false
            }
        };
        context.listener.on_completed(&request, succeeded);

        if succeeded {
            log::trace!(
                "{}: succeeded after {} retries",
                request.name(),
                request.retries()
            );
            let completion = Completion::Succeeded {
                retries: request.retries(),
            };
            context.record(&request, completion);
        } else if shutdown.is_cancelled() {
            break;
        } else if request.begin_retry() {
            log::trace!("{}: failed, retrying...", request.name());
            context.schedule_retry(request);
        } else {
            log::trace!(
                "{}: failed, giving up after {} retries",
                request.name(),
                request.retries()
            );
            let completion = Completion::Failed {
                retries: request.retries(),
            };
            context.record(&request, completion);
        }
    }

    log::debug!("{} worker stopped", context.name);
}
