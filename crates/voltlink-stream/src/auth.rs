//! Streaming credentials.
//!
//! The streaming endpoint does not accept the owner-API bearer token. It
//! wants the account identity paired with a short-lived streaming token
//! that the portal hands out in the vehicle listing, and only while the
//! vehicle is awake. [`PortalAuthenticator`] repeats a fetch-then-wake
//! round until the listing carries a token; the session calls it again
//! whenever the stream rejects the current token.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::api::ApiClient;
use crate::error::{ApiError, AuthError};

/// Identity and token accepted by the streaming endpoint.
///
/// There is no known expiry; the context is valid until the server
/// rejects it.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub username: String,
    /// Identity used in the stream URL, distinct from the REST id.
    pub streaming_vehicle_id: String,
    pub streaming_token: String,
}

impl AuthContext {
    /// Value for the `Authorization` header of a stream request.
    pub fn basic_authorization(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.streaming_token);
        format!("Basic {}", STANDARD.encode(credentials))
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("username", &self.username)
            .field("streaming_vehicle_id", &self.streaming_vehicle_id)
            .field("streaming_token", &"<redacted>")
            .finish()
    }
}

/// Exchanges account credentials for a fresh [`AuthContext`].
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Obtain streaming credentials for the vehicle with REST id
    /// `vehicle_id`, waking it if needed.
    async fn reauthenticate(&self, vehicle_id: &str) -> Result<AuthContext, AuthError>;
}

/// [`Authenticator`] backed by the owner API.
#[derive(Debug, Clone)]
pub struct PortalAuthenticator {
    api: ApiClient,
    username: String,
    wakeup_attempts: usize,
    wakeup_delay: Duration,
}

impl PortalAuthenticator {
    pub fn new(api: ApiClient, username: impl Into<String>) -> Self {
        Self {
            api,
            username: username.into(),
            wakeup_attempts: 3,
            wakeup_delay: Duration::from_millis(500),
        }
    }

    /// Total fetch-and-wake rounds (at least one) and the pause after each
    /// wake-up.
    #[must_use]
    pub fn with_wakeup(mut self, attempts: usize, delay: Duration) -> Self {
        self.wakeup_attempts = attempts.max(1);
        self.wakeup_delay = delay;
        self
    }

    /// One round: list the vehicles and take the streaming token if the
    /// vehicle has one, otherwise send a wake-up and report the token as
    /// missing so the round is retried.
    async fn fetch_or_wake(&self, vehicle_id: &str) -> Result<AuthContext, AuthError> {
        let vehicles = self.api.vehicles().await.map_err(portal_error)?;
        let vehicle = vehicles
            .into_iter()
            .find(|v| v.id == vehicle_id)
            .ok_or_else(|| AuthError::UnknownVehicle(vehicle_id.to_string()))?;

        if let Some(token) = vehicle.streaming_token() {
            return Ok(AuthContext {
                username: self.username.clone(),
                streaming_token: token.to_string(),
                streaming_vehicle_id: vehicle.vehicle_id,
            });
        }

        log::debug!("No streaming token for vehicle {} yet, waking it", vehicle_id);
        self.api.wake_up(vehicle_id).await.map_err(portal_error)?;
        Err(AuthError::MissingToken(vehicle_id.to_string()))
    }
}

#[async_trait]
impl Authenticator for PortalAuthenticator {
    async fn reauthenticate(&self, vehicle_id: &str) -> Result<AuthContext, AuthError> {
        log::info!("Refreshing streaming token for vehicle {}", vehicle_id);
        let backoff = ConstantBuilder::default()
            .with_delay(self.wakeup_delay)
            .with_max_times(self.wakeup_attempts - 1);

        (|| async { self.fetch_or_wake(vehicle_id).await })
            .retry(backoff)
            .when(|e: &AuthError| !is_final(e))
            .notify(|e: &AuthError, after: Duration| {
                log::debug!(
                    "Streaming token for {} unavailable ({}), retrying in {:?}",
                    vehicle_id,
                    e,
                    after
                );
            })
            .await
            .map_err(|e| {
                if is_final(&e) {
                    e
                } else {
                    AuthError::WakeupFailed {
                        attempts: self.wakeup_attempts,
                        source: Box::new(e),
                    }
                }
            })
    }
}

/// Failures another round cannot fix.
fn is_final(error: &AuthError) -> bool {
    matches!(error, AuthError::Unauthorized | AuthError::UnknownVehicle(_))
}

fn portal_error(error: ApiError) -> AuthError {
    if is_unauthorized(&error) {
        AuthError::Unauthorized
    } else {
        AuthError::Api(error)
    }
}

fn is_unauthorized(error: &ApiError) -> bool {
    matches!(error, ApiError::Transport(t) if t.is_auth_failure())
}
