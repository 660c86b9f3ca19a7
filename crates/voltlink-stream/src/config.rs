use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use confyg::{env, Confygery};
use serde::{Deserialize, Serialize};
use voltlink_core::rate_limit::{DEFAULT_CALL_LOG_CAPACITY, DEFAULT_THROTTLE_BACKOFF};
use voltlink_core::{RateLimiter, RateWindowRule};

pub const DEFAULT_PORTAL_URL: &str = "https://owner-api.teslamotors.com";
pub const DEFAULT_STREAM_URL: &str = "https://streaming.vn.teslamotors.com";

/// Configuration for voltlink.
///
/// Configuration is loaded from multiple sources with the following priority:
/// 1. CLI arguments (highest priority)
/// 2. Environment variables (VOLT_* prefix)
/// 3. Config file (~/.config/voltlink/config.toml)
/// 4. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account e-mail; also the identity half of the streaming credentials.
    ///
    /// Can be set via:
    /// - ENV: VOLT_USERNAME
    /// - Config: username = "..."
    #[serde(default)]
    pub username: Option<String>,

    /// Bearer token for the owner API.
    ///
    /// Can be set via:
    /// - ENV: VOLT_ACCESS_TOKEN
    /// - Config: access_token = "..."
    #[serde(default)]
    pub access_token: Option<String>,

    /// Owner-API id of the vehicle to talk to.
    ///
    /// Can be set via:
    /// - CLI: --vehicle 1234
    /// - ENV: VOLT_VEHICLE_ID
    /// - Config: vehicle_id = "..."
    #[serde(default)]
    pub vehicle_id: Option<String>,

    #[serde(default = "default_portal_url")]
    pub portal_url: String,

    #[serde(default = "default_stream_url")]
    pub stream_url: String,

    /// Sliding-window limits as `[max_calls, window_secs]` pairs.
    #[serde(default = "default_rate_limits")]
    pub rate_limits: Vec<(usize, u64)>,

    #[serde(default = "default_call_log_capacity")]
    pub call_log_capacity: usize,

    #[serde(default = "default_throttle_backoff_secs")]
    pub throttle_backoff_secs: u64,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    #[serde(default = "default_wakeup_attempts")]
    pub wakeup_attempts: usize,

    #[serde(default = "default_wakeup_delay_ms")]
    pub wakeup_delay_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: None,
            access_token: None,
            vehicle_id: None,
            portal_url: default_portal_url(),
            stream_url: default_stream_url(),
            rate_limits: default_rate_limits(),
            call_log_capacity: default_call_log_capacity(),
            throttle_backoff_secs: default_throttle_backoff_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            wakeup_attempts: default_wakeup_attempts(),
            wakeup_delay_ms: default_wakeup_delay_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Searches for config file at: ~/.config/voltlink/config.toml
    /// Reads environment variables with VOLT_ prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from an explicit file plus the environment.
    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        let mut builder = Confygery::new().context("Failed to create config builder")?;

        if config_path.exists() {
            let path_str = config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?;
            builder
                .add_file(path_str)
                .context("Failed to load config file")?;
        }

        let env_opts = env::Options::with_top_level("volt");
        builder
            .add_env(env_opts)
            .context("Failed to load environment variables")?;

        let config: Self = builder.build().context("Failed to build configuration")?;

        Ok(config)
    }

    /// Validated window rules.
    ///
    /// # Errors
    /// Returns an error naming the first rule with a zero count or window.
    pub fn rate_rules(&self) -> Result<Vec<RateWindowRule>> {
        self.rate_limits
            .iter()
            .map(|&(count, secs)| {
                RateWindowRule::new(count, secs).context("Invalid entry in rate_limits")
            })
            .collect()
    }

    /// Build the limiter shared by every outbound call.
    pub fn rate_limiter(&self) -> Result<RateLimiter> {
        let limiter = RateLimiter::with_capacity(self.rate_rules()?, self.call_log_capacity)
            .context("Invalid rate limiter settings")?;
        Ok(limiter.with_backoff(self.throttle_backoff()))
    }

    pub fn username(&self) -> Result<&str> {
        self.username
            .as_deref()
            .context("No username configured (set VOLT_USERNAME or username)")
    }

    pub fn access_token(&self) -> Result<&str> {
        self.access_token
            .as_deref()
            .context("No access token configured (set VOLT_ACCESS_TOKEN or access_token)")
    }

    pub fn vehicle_id(&self) -> Result<&str> {
        self.vehicle_id
            .as_deref()
            .context("No vehicle configured (set VOLT_VEHICLE_ID or vehicle_id)")
    }

    pub fn throttle_backoff(&self) -> Duration {
        Duration::from_secs(self.throttle_backoff_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn wakeup_delay(&self) -> Duration {
        Duration::from_millis(self.wakeup_delay_ms)
    }
}

fn default_portal_url() -> String {
    DEFAULT_PORTAL_URL.to_string()
}

fn default_stream_url() -> String {
    DEFAULT_STREAM_URL.to_string()
}

fn default_rate_limits() -> Vec<(usize, u64)> {
    RateLimiter::default_rules()
        .into_iter()
        .map(Into::into)
        .collect()
}

fn default_call_log_capacity() -> usize {
    DEFAULT_CALL_LOG_CAPACITY
}

fn default_throttle_backoff_secs() -> u64 {
    DEFAULT_THROTTLE_BACKOFF.as_secs()
}

fn default_read_timeout_secs() -> u64 {
    25
}

fn default_connect_attempts() -> usize {
    5
}

fn default_connect_retry_delay_ms() -> u64 {
    500
}

fn default_wakeup_attempts() -> usize {
    3
}

fn default_wakeup_delay_ms() -> u64 {
    500
}

fn default_queue_capacity() -> usize {
    voltlink_core::executor::DEFAULT_QUEUE_CAPACITY
}

/// Get the config file path.
///
/// Returns:
/// - Linux: ~/.config/voltlink/config.toml
/// - macOS: ~/Library/Application Support/voltlink/config.toml
/// - Windows: %APPDATA%\voltlink\config.toml
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("voltlink")
        .join("config.toml")
}

/// Get the example config file content.
pub fn example_config() -> &'static str {
    r#"# Voltlink Configuration File
#
# Configuration is loaded from multiple sources with the following priority:
# 1. CLI arguments (highest priority)
# 2. Environment variables (VOLT_* prefix)
# 3. This config file
# 4. Built-in defaults (lowest priority)

# Account credentials for the owner API
#
# Can also be set via:
# - Environment: VOLT_USERNAME=you@example.com
# - Environment: VOLT_ACCESS_TOKEN=your-token
username = "you@example.com"
access_token = "your-access-token-here"

# Owner-API id of the vehicle (see `voltlink vehicles`)
#vehicle_id = "12345678901234567"

# Service endpoints
#portal_url = "https://owner-api.teslamotors.com"
#stream_url = "https://streaming.vn.teslamotors.com"

# Sliding-window throttle: [max_calls, window_seconds]
# Every rule must hold at once before a request is sent.
#rate_limits = [[10, 10], [20, 60], [150, 600]]
#call_log_capacity = 200
#throttle_backoff_secs = 5

# Streaming
#read_timeout_secs = 25
#connect_attempts = 5
#connect_retry_delay_ms = 500
#wakeup_attempts = 3
#wakeup_delay_ms = 500

# Command queue
#queue_capacity = 20
"#
}

/// Create default config file if it doesn't exist.
///
/// Returns true if a new file was created, false if it already existed.
pub fn ensure_config_file() -> Result<bool> {
    ensure_config_file_at(&config_file_path())
}

pub fn ensure_config_file_at(config_path: &std::path::Path) -> Result<bool> {
    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    std::fs::write(config_path, example_config()).context("Failed to write config file")?;

    Ok(true)
}
