pub mod config;
pub mod limits;
pub mod stream;
pub mod vehicle;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use voltlink_core::RateLimiter;
use voltlink_stream::{ApiClient, Config, HttpTransport, PortalAuthenticator, Transport};

pub use limits::show_limits;
pub use stream::run_stream;
pub use vehicle::{list_vehicles, run_command};

/// Load configuration, honouring `--config` and `--vehicle`.
pub fn load_config(path: Option<&Path>, vehicle: Option<String>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if vehicle.is_some() {
        config.vehicle_id = vehicle;
    }
    Ok(config)
}

/// The pieces every networked command shares: one transport and one rate
/// limiter for all outbound calls.
#[derive(Debug)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub limiter: Arc<RateLimiter>,
    pub api: ApiClient,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport: Arc<dyn Transport> =
            Arc::new(HttpTransport::new().context("Failed to create HTTP client")?);
        let limiter = Arc::new(config.rate_limiter()?);
        let api = ApiClient::new(
            Arc::clone(&transport),
            Arc::clone(&limiter),
            &config.portal_url,
            config.access_token()?,
        );
        Ok(Self {
            transport,
            limiter,
            api,
        })
    }

    pub fn authenticator(&self, config: &Config) -> Result<PortalAuthenticator> {
        Ok(PortalAuthenticator::new(self.api.clone(), config.username()?)
            .with_wakeup(config.wakeup_attempts, config.wakeup_delay()))
    }
}
