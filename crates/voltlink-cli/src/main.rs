use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "voltlink", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: ~/.config/voltlink/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Vehicle to talk to, overriding the configured vehicle_id
    #[arg(long, global = true)]
    vehicle: Option<String>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Stream live telemetry from the vehicle
    ///
    /// Opens the streaming endpoint and prints one line per update. The
    /// stream survives dropped connections and expired streaming tokens:
    /// the client reconnects on its own, waking the vehicle and fetching a
    /// fresh token when the server rejects the old one. Malformed lines are
    /// logged and skipped.
    ///
    /// All requests, including reconnects, pass the configured rate limits.
    /// Press Ctrl-C to stop.
    Stream {
        /// Stop after this many records
        #[arg(long)]
        count: Option<usize>,

        /// Fields to request (default: all)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Send a command to the vehicle, retrying on failure
    Command {
        /// Command name, e.g. honk_horn or door_unlock
        name: String,

        /// Command parameters as key=value
        #[arg(long = "param", short = 'p')]
        params: Vec<String>,

        /// Retries after the first attempt
        #[arg(long, default_value_t = 2)]
        retries: u32,

        /// Seconds to wait between attempts
        #[arg(long, default_value_t = 5)]
        retry_delay: u64,
    },
    /// Wake the vehicle
    Wake,
    /// List vehicles on the account
    Vehicles,
    /// Show the configured rate limits
    Limits,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Create the config file from the example if it doesn't exist
    Init,
    /// Print an example config file
    Example,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Cli {
        command,
        config: config_path,
        vehicle,
    } = Cli::parse();
    let config_path = config_path.as_deref();

    match command {
        Commands::Stream {
            count,
            fields,
            json,
        } => {
            let config = commands::load_config(config_path, vehicle)?;
            commands::run_stream(&config, count, &fields, json).await?;
        }
        Commands::Command {
            name,
            params,
            retries,
            retry_delay,
        } => {
            let config = commands::load_config(config_path, vehicle)?;
            commands::run_command(&config, Some(&name), &params, retries, retry_delay).await?;
        }
        Commands::Wake => {
            let config = commands::load_config(config_path, vehicle)?;
            commands::run_command(&config, None, &[], 2, 5).await?;
        }
        Commands::Vehicles => {
            let config = commands::load_config(config_path, vehicle)?;
            commands::list_vehicles(&config).await?;
        }
        Commands::Limits => {
            let config = commands::load_config(config_path, vehicle)?;
            commands::show_limits(&config)?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show_config(config_path)?,
            ConfigAction::Path => commands::config::show_path(config_path),
            ConfigAction::Init => commands::config::init_config(config_path)?,
            ConfigAction::Example => print!("{}", voltlink_stream::config::example_config()),
        },
    }

    Ok(())
}
