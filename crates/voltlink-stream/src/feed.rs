//! Background telemetry feed.
//!
//! [`StreamFeed`] drives a [`StreamSession`] on its own task and buffers
//! decoded records in a bounded channel, so consumers can poll for the
//! latest telemetry with a timeout instead of blocking on the network.
//! When the session gives up, re-establishing it is handed to a
//! [`RetryingExecutor`] as a [`ReconnectRequest`], so reconnects get the
//! executor's bounded retries and show up in its histogram.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use voltlink_core::{
    CompletionHistogram, ExecutorContext, FeedbackListener, LoggingListener, Request,
    RetryingExecutor,
};

use crate::command::ReconnectRequest;
use crate::error::StreamError;
use crate::fields::StreamRecord;
use crate::session::StreamSession;

/// Records buffered before the producer waits for the consumer.
pub const FEED_CAPACITY: usize = 25;

/// Pause after the session gives up before it is tried again. Also the
/// delay between reconnect retries.
pub const DEFAULT_GIVE_UP_BACKOFF: Duration = Duration::from_secs(30);

/// A running producer of [`StreamRecord`]s. Dropping it stops the task.
#[derive(Debug)]
pub struct StreamFeed {
    records: mpsc::Receiver<StreamRecord>,
    shutdown: CancellationToken,
    reconnects: RetryingExecutor,
    task: Option<JoinHandle<()>>,
}

impl StreamFeed {
    /// Start feeding records from `session`. The feed stops when
    /// `shutdown` is cancelled or the feed is dropped.
    pub fn spawn(
        session: StreamSession,
        give_up_backoff: Duration,
        shutdown: &CancellationToken,
    ) -> Self {
        let shutdown = shutdown.child_token();
        let settled = Arc::new(Notify::new());
        let reconnects = RetryingExecutor::builder("stream reconnect")
            .listener(Arc::new(ReconnectWatch {
                settled: Arc::clone(&settled),
            }))
            .shutdown(&shutdown)
            .spawn();
        let producer = Producer {
            session: Arc::new(Mutex::new(session.with_shutdown(&shutdown))),
            reconnects: Arc::clone(reconnects.context()),
            settled,
            give_up_backoff,
            shutdown: shutdown.clone(),
        };
        let (sender, records) = mpsc::channel(FEED_CAPACITY);
        let task = tokio::spawn(producer.run(sender));
        Self {
            records,
            shutdown,
            reconnects,
            task: Some(task),
        }
    }

    /// Wait up to `wait` for the next record.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<StreamRecord> {
        timeout(wait, self.records.recv()).await.ok().flatten()
    }

    /// Wait for the next record; `None` once the feed has stopped.
    pub async fn recv(&mut self) -> Option<StreamRecord> {
        self.records.recv().await
    }

    /// A buffered record, if one is ready.
    pub fn try_recv(&mut self) -> Option<StreamRecord> {
        self.records.try_recv().ok()
    }

    /// Outcomes of the reconnects run so far.
    pub fn reconnect_histogram(&self) -> CompletionHistogram {
        self.reconnects.histogram()
    }

    /// Stop the producer and wait for it to close the stream.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Telemetry feed ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for StreamFeed {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Wakes the producer once a reconnect request has settled, either by
/// succeeding or by running out of retries.
#[derive(Debug)]
struct ReconnectWatch {
    settled: Arc<Notify>,
}

impl FeedbackListener for ReconnectWatch {
    fn on_started(&self, request: &Request) {
        LoggingListener.on_started(request);
    }

    fn on_completed(&self, request: &Request, succeeded: bool) {
        LoggingListener.on_completed(request, succeeded);
        if succeeded || request.retries() >= request.max_retries() {
            self.settled.notify_one();
        }
    }

    fn on_histogram(&self, name: &str, histogram: &CompletionHistogram) {
        LoggingListener.on_histogram(name, histogram);
    }
}

struct Producer {
    session: Arc<Mutex<StreamSession>>,
    reconnects: Arc<ExecutorContext>,
    settled: Arc<Notify>,
    give_up_backoff: Duration,
    shutdown: CancellationToken,
}

impl Producer {
    async fn run(self, sender: mpsc::Sender<StreamRecord>) {
        let vehicle_id = self.session.lock().await.vehicle_id().to_string();
        log::debug!("Telemetry feed started for vehicle {}", vehicle_id);

        loop {
            let next = self.session.lock().await.next_record().await;
            match next {
                Ok(Some(record)) => {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        sent = sender.send(record) => if sent.is_err() { break },
                    }
                }
                Ok(None) => {}
                Err(StreamError::Cancelled) => break,
                Err(e) => {
                    log::warn!(
                        "Telemetry feed interrupted: {}; reconnecting in {:?}",
                        e,
                        self.give_up_backoff
                    );
                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }

        self.session.lock().await.close();
        log::debug!("Telemetry feed stopped for vehicle {}", vehicle_id);
    }

    /// Submit reconnects until one leaves the session connected. Returns
    /// `false` on shutdown.
    async fn reconnect(&self) -> bool {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = sleep(self.give_up_backoff) => {}
            }

            let request = Request::new(ReconnectRequest::new(Arc::clone(&self.session)))
                .with_retry_delay(self.give_up_backoff);
            if let Err(e) = self.reconnects.submit(request).await {
                log::debug!("Reconnect not submitted: {}", e);
                return false;
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = self.settled.notified() => {}
            }

            if self.session.lock().await.is_connected() {
                return true;
            }
            log::warn!(
                "Stream reconnect ran out of retries; trying again in {:?}",
                self.give_up_backoff
            );
        }
    }
}
