//! Error types for the streaming and REST layers.

use thiserror::Error;

/// Failures of a single HTTP exchange or stream read.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// No response within the configured timeout.
    #[error("timed out talking to {0}")]
    Timeout(String),

    /// An error propagated from `reqwest`.
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl TransportError {
    /// Returns `true` when the credentials were rejected and retrying with
    /// the same token is pointless.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 401 | 403),
            Self::Request(e) => e
                .status()
                .is_some_and(|s| matches!(s.as_u16(), 401 | 403)),
            Self::Timeout(_) => false,
        }
    }

    /// Returns `true` when the same request may succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Timeout(_) => true,
            Self::Request(e) => !e.is_builder() && !self.is_auth_failure(),
        }
    }
}

/// Failures of the REST helper.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The response body was not the expected JSON.
    #[error("unexpected response from {url}: {message}")]
    Parse { url: String, message: String },

    /// The service answered but reported the command as not performed.
    #[error("{command} rejected: {reason}")]
    Rejected { command: String, reason: String },
}

/// Failures while obtaining a streaming token.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The portal rejected the access token itself.
    #[error("access token rejected by portal")]
    Unauthorized,

    /// The configured vehicle is not on the account.
    #[error("vehicle {0} not found on account")]
    UnknownVehicle(String),

    /// The vehicle listing carried no streaming token.
    #[error("no streaming token for vehicle {0}")]
    MissingToken(String),

    /// No streaming token after every fetch-and-wake round.
    #[error("vehicle did not wake after {attempts} attempts: {source}")]
    WakeupFailed {
        attempts: usize,
        #[source]
        source: Box<AuthError>,
    },

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A stream line that does not fit the field set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("expected {expected} values, found {found}")]
    Arity { expected: usize, found: usize },

    #[error("bad value {value:?} for {field}")]
    BadToken { field: &'static str, value: String },
}

/// Hard failures surfaced by a stream session.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Reconnect and reauthentication attempts were exhausted. The session
    /// has been reset.
    #[error("gave up after {attempts} connection attempts: {last}")]
    GaveUp {
        attempts: usize,
        #[source]
        last: TransportError,
    },

    /// The authenticator could not produce a streaming token.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Shutdown was requested while the session was waiting.
    #[error("stream session cancelled")]
    Cancelled,
}

impl StreamError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenience alias for REST results.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
