//! Operations and the requests that carry them through the executor.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use uuid::Uuid;

/// Retries granted to a request unless its operation asks otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Delay before a failed request is re-submitted.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Outcome of one attempt: `Ok(true)` succeeded, `Ok(false)` failed.
///
/// An `Err` counts exactly like `Ok(false)`; the error is only logged.
pub type OperationResult = Result<bool, Box<dyn std::error::Error + Send + Sync>>;

/// A fallible unit of work the executor can run and retry.
///
/// Implementors override the provided methods to change the retry budget
/// or delay for their request type, and `is_superseded` to skip work that
/// became pointless while it sat in the queue.
#[async_trait]
pub trait Operation: Send + Sync + fmt::Debug {
    /// Run one attempt.
    async fn execute(&self) -> OperationResult;

    /// Display name used in logs and histogram reports.
    fn name(&self) -> &str {
        "Unknown"
    }

    fn max_retries(&self) -> u32 {
        DEFAULT_MAX_RETRIES
    }

    fn retry_delay(&self) -> Duration {
        DEFAULT_RETRY_DELAY
    }

    /// Checked right before each attempt. A superseded request is dropped
    /// without running and without touching the histogram.
    async fn is_superseded(&self) -> bool {
        false
    }
}

/// An [`Operation`] plus its bookkeeping while owned by an executor.
#[derive(Clone)]
pub struct Request {
    id: Uuid,
    operation: Arc<dyn Operation>,
    created_at: SystemTime,
    retries: u32,
    max_retries: u32,
    retry_delay: Duration,
    name: String,
}

impl Request {
    /// Wrap an operation, taking its retry policy and name as defaults.
    pub fn new(operation: impl Operation + 'static) -> Self {
        Self::from_shared(Arc::new(operation))
    }

    /// Wrap an operation that is also held elsewhere.
    pub fn from_shared(operation: Arc<dyn Operation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            max_retries: operation.max_retries(),
            retry_delay: operation.retry_delay(),
            name: operation.name().to_string(),
            created_at: SystemTime::now(),
            retries: 0,
            operation,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation(&self) -> &Arc<dyn Operation> {
        &self.operation
    }

    /// Retries performed so far; zero while the first attempt is pending.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Creation time as milliseconds since the Unix epoch.
    pub fn created_at_millis(&self) -> u128 {
        self.created_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
    }

    /// Consume one retry from the budget. Returns `false` once exhausted.
    pub(crate) fn begin_retry(&mut self) -> bool {
        if self.retries < self.max_retries {
            self.retries += 1;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("retries", &self.retries)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}
