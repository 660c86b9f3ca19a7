//! Executor operations for vehicle commands and stream reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use voltlink_core::{Operation, OperationResult};

use crate::api::ApiClient;
use crate::error::ApiError;
use crate::session::StreamSession;

#[derive(Debug, Clone)]
enum Action {
    WakeUp,
    Command {
        name: String,
        params: serde_json::Value,
    },
}

/// A vehicle command run through a
/// [`RetryingExecutor`](voltlink_core::RetryingExecutor).
///
/// A command the vehicle refuses (`result: false`) counts as a failed
/// attempt and is retried like a transport error.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    api: ApiClient,
    vehicle_id: String,
    action: Action,
    label: String,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
}

impl CommandRequest {
    /// Run `/command/{name}` with the given JSON parameters.
    pub fn new(
        api: ApiClient,
        vehicle_id: impl Into<String>,
        name: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let name = name.into();
        Self {
            api,
            vehicle_id: vehicle_id.into(),
            label: name.clone(),
            action: Action::Command { name, params },
            max_retries: None,
            retry_delay: None,
        }
    }

    /// Wake the vehicle.
    pub fn wake_up(api: ApiClient, vehicle_id: impl Into<String>) -> Self {
        Self {
            api,
            vehicle_id: vehicle_id.into(),
            label: "wake_up".to_string(),
            action: Action::WakeUp,
            max_retries: None,
            retry_delay: None,
        }
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = Some(max_retries);
        self.retry_delay = Some(retry_delay);
        self
    }
}

#[async_trait]
impl Operation for CommandRequest {
    async fn execute(&self) -> OperationResult {
        let outcome = match &self.action {
            Action::WakeUp => self.api.wake_up(&self.vehicle_id).await,
            Action::Command { name, params } => self
                .api
                .command(&self.vehicle_id, name, params.clone())
                .await
                .map(|_| ()),
        };
        match outcome {
            Ok(()) => Ok(true),
            Err(ApiError::Rejected { command, reason }) => {
                log::info!("Vehicle refused {}: {}", command, reason);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
            .unwrap_or(voltlink_core::executor::DEFAULT_MAX_RETRIES)
    }

    fn retry_delay(&self) -> Duration {
        self.retry_delay
            .unwrap_or(voltlink_core::executor::DEFAULT_RETRY_DELAY)
    }
}

/// Re-establishes a shared [`StreamSession`] on an executor.
///
/// Superseded when, by the time the request reaches the front of the
/// queue, the session already has a live connection or is locked by
/// another task.
#[derive(Debug, Clone)]
pub struct ReconnectRequest {
    session: Arc<Mutex<StreamSession>>,
}

impl ReconnectRequest {
    pub fn new(session: Arc<Mutex<StreamSession>>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Operation for ReconnectRequest {
    async fn execute(&self) -> OperationResult {
        let mut session = self.session.lock().await;
        session.connect().await?;
        Ok(true)
    }

    fn name(&self) -> &str {
        "reconnect stream"
    }

    async fn is_superseded(&self) -> bool {
        match self.session.try_lock() {
            Ok(session) => session.is_connected(),
            // Held by a reader or another reconnect: someone else owns it.
            Err(_) => true,
        }
    }
}
