//! Service-facing layer of voltlink.
//!
//! Everything here talks to the remote service, and every outbound call
//! passes the shared [`RateLimiter`](voltlink_core::RateLimiter) first:
//!
//! - [`ApiClient`]: owner REST API (vehicle list, wake-up, commands)
//! - [`PortalAuthenticator`]: wakes the vehicle and fetches a streaming token
//! - [`StreamSession`]: reconnecting reader of the telemetry stream
//! - [`StreamFeed`]: runs a session in the background behind a bounded buffer
//! - [`CommandRequest`] and [`ReconnectRequest`]: operations for a
//!   [`RetryingExecutor`](voltlink_core::RetryingExecutor)

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod api;
pub mod auth;
pub mod command;
pub mod config;
pub mod error;
pub mod feed;
pub mod fields;
pub mod session;
pub mod transport;

pub use api::{ApiClient, CommandResult, VehicleSummary};
pub use auth::{AuthContext, Authenticator, PortalAuthenticator};
pub use command::{CommandRequest, ReconnectRequest};
pub use config::Config;
pub use error::{ApiError, AuthError, DecodeError, StreamError, TransportError};
pub use feed::StreamFeed;
pub use fields::{FieldSet, StreamField, StreamRecord, FIELD_ORDER};
pub use session::{SessionSettings, StreamSession, StreamSessionState};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, LineSource, Transport};
