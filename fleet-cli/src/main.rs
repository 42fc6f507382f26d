//! FleetOps CLI - command-line client for the FleetOps connectivity layer.
//!
//! Signs in, holds the realtime socket open, executes API requests through
//! the retrying executor, and inspects or replays the offline action queue.
//! Useful for headless operation, scripting, and debugging a server.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use fleet_core::config::{AppConfig, ConfigHandle};
use fleet_core::error::FleetResult;
use fleet_core::logging;

/// FleetOps - fleet operations client.
#[derive(Parser)]
#[command(
    name = "fleet",
    version,
    about = "FleetOps client CLI",
    long_about = "A command-line interface for the FleetOps client.\n\
                  Talks to the fleet API and realtime socket, and replays actions taken offline."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json).
    #[arg(short = 'f', long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// JSON output for scripting.
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a credential and open the realtime connection.
    Login {
        /// Access token (prompted if omitted).
        #[arg(long)]
        access_token: Option<String>,
        /// Refresh token (prompted if omitted).
        #[arg(long)]
        refresh_token: Option<String>,
        /// User id (prompted if omitted).
        #[arg(long)]
        user_id: Option<String>,
        /// User type sent on the socket URL (e.g. driver, dispatcher).
        #[arg(long)]
        user_type: Option<String>,
    },
    /// Forget the stored credential. Queued actions are kept.
    Logout,
    /// Show session, connection and queue status.
    Status,
    /// Show local component health and the server health report.
    Health,
    /// Connect and stream events until interrupted.
    Connect {
        /// Extra topics to subscribe to.
        #[arg(short, long)]
        topic: Vec<String>,
    },
    /// Execute one API request through the retrying executor.
    Request {
        /// HTTP method (GET, POST, PUT, DELETE, ...).
        method: String,
        /// Path relative to the API base URL.
        path: String,
        /// JSON request body.
        #[arg(short, long)]
        body: Option<String>,
    },
    /// Submit a user action, queueing it when the network is unavailable.
    Submit {
        /// Action kind (e.g. start_trip, complete_delivery).
        kind: String,
        /// JSON payload.
        payload: String,
    },
    /// Inspect and manage the offline action queue.
    Queue {
        #[command(subcommand)]
        action: commands::queue::QueueAction,
    },
    /// View or create the configuration file.
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn load_config(path: Option<&PathBuf>) -> FleetResult<(AppConfig, PathBuf)> {
    let path = match path {
        Some(p) => p.clone(),
        None => AppConfig::default_config_path()?,
    };
    let mut config = if path.exists() {
        AppConfig::load_from_file(&path)?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    Ok((config, path))
}

#[tokio::main]
async fn main() -> FleetResult<()> {
    let cli = Cli::parse();

    let (config, config_path) = load_config(cli.config.as_ref())?;

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    let log_dir = config
        .effective_log_dir()
        .unwrap_or_else(|_| PathBuf::from("logs"));
    let _guard = logging::init_logging(&log_level, &log_dir, config.logging.json_output)?;

    info!("FleetOps CLI v{}", fleet_core::constants::APP_VERSION);

    let config = ConfigHandle::new(config);

    match cli.command {
        Commands::Login {
            access_token,
            refresh_token,
            user_id,
            user_type,
        } => {
            commands::session::login(
                config,
                commands::session::LoginArgs {
                    access_token,
                    refresh_token,
                    user_id,
                    user_type,
                },
                cli.format,
            )
            .await
        }
        Commands::Logout => commands::session::logout(config, cli.format).await,
        Commands::Status => commands::status::run(config, cli.format).await,
        Commands::Health => commands::status::health(config, cli.format).await,
        Commands::Connect { topic } => commands::connect::run(config, topic, cli.format).await,
        Commands::Request { method, path, body } => {
            commands::request::run(config, method, path, body, cli.format).await
        }
        Commands::Submit { kind, payload } => {
            commands::queue::submit(config, kind, payload, cli.format).await
        }
        Commands::Queue { action } => commands::queue::run(config, action, cli.format).await,
        Commands::Config { action } => {
            commands::config::run(config, config_path, action, cli.format).await
        }
    }
}
