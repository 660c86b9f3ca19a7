use std::path::{Path, PathBuf};

use anyhow::Result;
use voltlink_stream::{config, Config};

fn resolve(path: Option<&Path>) -> PathBuf {
    path.map_or_else(config::config_file_path, Path::to_path_buf)
}

/// Show the current effective configuration.
pub fn show_config(path: Option<&Path>) -> Result<()> {
    let config_path = resolve(path);
    let config = Config::load_from(&config_path)?;

    println!("Current Configuration");
    println!("=====================\n");

    println!("Config file: {}", config_path.display());
    let exists = config_path.exists();
    println!("File exists: {}\n", if exists { "yes" } else { "no (using defaults)" });

    println!("Settings:");
    println!("  username: {}", config.username.as_deref().unwrap_or("<not set>"));
    println!(
        "  access_token: {}",
        if config.access_token.is_some() { "<set>" } else { "<not set>" }
    );
    println!("  vehicle_id: {}", config.vehicle_id.as_deref().unwrap_or("<not set>"));
    println!("  portal_url: {}", config.portal_url);
    println!("  stream_url: {}", config.stream_url);
    println!("  rate_limits: {:?}", config.rate_limits);
    println!("  call_log_capacity: {}", config.call_log_capacity);
    println!("  throttle_backoff_secs: {}", config.throttle_backoff_secs);
    println!("  read_timeout_secs: {}", config.read_timeout_secs);
    println!("  connect_attempts: {}", config.connect_attempts);
    println!("  connect_retry_delay_ms: {}", config.connect_retry_delay_ms);
    println!("  wakeup_attempts: {}", config.wakeup_attempts);
    println!("  wakeup_delay_ms: {}", config.wakeup_delay_ms);
    println!("  queue_capacity: {}", config.queue_capacity);

    println!("\nPriority: CLI args > ENV vars (VOLT_*) > Config file > Defaults");

    Ok(())
}

pub fn show_path(path: Option<&Path>) {
    println!("{}", resolve(path).display());
}

/// Create the config file from the example.
pub fn init_config(path: Option<&Path>) -> Result<()> {
    let config_path = resolve(path);
    if config::ensure_config_file_at(&config_path)? {
        println!("Created {}", config_path.display());
    } else {
        println!("Config file already exists: {}", config_path.display());
    }
    Ok(())
}
