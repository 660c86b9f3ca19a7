use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::oneshot;
use voltlink_core::{
    CompletionHistogram, FeedbackListener, LoggingListener, Request, RetryingExecutor,
};
use voltlink_stream::{CommandRequest, Config};

use super::Services;

/// Reports the final outcome of the one request this command submits.
#[derive(Debug)]
struct OutcomeListener {
    outcome: Mutex<Option<oneshot::Sender<bool>>>,
}

impl OutcomeListener {
    fn new() -> (Self, oneshot::Receiver<bool>) {
        let (sender, receiver) = oneshot::channel();
        let listener = Self {
            outcome: Mutex::new(Some(sender)),
        };
        (listener, receiver)
    }
}

impl FeedbackListener for OutcomeListener {
    fn on_started(&self, request: &Request) {
        LoggingListener.on_started(request);
        if request.retries() > 0 {
            println!(
                "Retrying {} ({}/{})",
                request.name(),
                request.retries(),
                request.max_retries()
            );
        }
    }

    fn on_completed(&self, request: &Request, succeeded: bool) {
        LoggingListener.on_completed(request, succeeded);
        if succeeded || request.retries() >= request.max_retries() {
            let sender = self
                .outcome
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                // The receiver is gone only if the command already returned.
                sender.send(succeeded).ok();
            }
        }
    }

    fn on_histogram(&self, name: &str, histogram: &CompletionHistogram) {
        LoggingListener.on_histogram(name, histogram);
    }
}

fn parse_params(params: &[String]) -> Result<serde_json::Value> {
    let mut object = serde_json::Map::new();
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("Parameter must be key=value: {param}"))?;
        // Numbers and booleans go out as JSON values, everything else as text.
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        object.insert(key.to_string(), value);
    }
    Ok(serde_json::Value::Object(object))
}

/// Run a vehicle command (or a wake-up when `name` is `None`) through a
/// retrying executor and wait for its final outcome.
pub async fn run_command(
    config: &Config,
    name: Option<&str>,
    params: &[String],
    retries: u32,
    retry_delay_secs: u64,
) -> Result<()> {
    let services = Services::from_config(config)?;
    let vehicle_id = config.vehicle_id()?;

    let operation = match name {
        Some(name) => {
            CommandRequest::new(services.api.clone(), vehicle_id, name, parse_params(params)?)
        }
        None => CommandRequest::wake_up(services.api.clone(), vehicle_id),
    }
    .with_retries(retries, Duration::from_secs(retry_delay_secs));
    let label = operation_label(name);

    let (listener, outcome) = OutcomeListener::new();
    let executor = RetryingExecutor::builder("commands")
        .listener(Arc::new(listener))
        .queue_capacity(config.queue_capacity)
        .spawn();

    executor
        .submit(Request::new(operation))
        .await
        .context("Failed to queue command")?;

    let succeeded = outcome.await.unwrap_or(false);
    executor.shutdown().await;

    if !succeeded {
        bail!("{} failed after {} retries", label, retries);
    }
    println!("{} succeeded", label);

    Ok(())
}

fn operation_label(name: Option<&str>) -> &str {
    name.unwrap_or("wake_up")
}

/// List the vehicles on the account.
pub async fn list_vehicles(config: &Config) -> Result<()> {
    let services = Services::from_config(config)?;
    let vehicles = services
        .api
        .vehicles()
        .await
        .context("Failed to list vehicles")?;

    if vehicles.is_empty() {
        println!("No vehicles on this account.");
        return Ok(());
    }

    for vehicle in vehicles {
        println!(
            "{}  {}  ({})",
            vehicle.id,
            vehicle.display_name.as_deref().unwrap_or("<unnamed>"),
            vehicle.state.as_deref().unwrap_or("unknown")
        );
    }

    Ok(())
}
