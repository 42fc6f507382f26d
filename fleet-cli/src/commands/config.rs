//! Config commands.

use std::path::PathBuf;

use clap::Subcommand;
use console::style;
use serde_json::json;

use fleet_core::config::{AppConfig, ConfigHandle};
use fleet_core::error::{FleetError, FleetResult};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration (file plus environment overrides).
    Show,
    /// Print the config file path.
    Path,
    /// Write a config file.
    Init {
        /// REST API base URL.
        #[arg(long)]
        api_url: String,
        /// WebSocket endpoint.
        #[arg(long)]
        ws_url: String,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(
    config: ConfigHandle,
    path: PathBuf,
    action: ConfigAction,
    format: OutputFormat,
) -> FleetResult<()> {
    match action {
        ConfigAction::Show => {
            let cfg = config.snapshot().await;
            match format {
                OutputFormat::Json => super::print_json(&serde_json::to_value(&cfg)?),
                OutputFormat::Text => {
                    let text = toml::to_string_pretty(&cfg)
                        .map_err(|e| FleetError::Config(e.to_string()))?;
                    println!("{text}");
                }
            }
        }
        ConfigAction::Path => match format {
            OutputFormat::Json => super::print_json(&json!({
                "path": path.display().to_string(),
                "exists": path.exists(),
            })),
            OutputFormat::Text => println!("{}", path.display()),
        },
        ConfigAction::Init {
            api_url,
            ws_url,
            force,
        } => {
            if path.exists() && !force {
                return Err(FleetError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            {
                let mut cfg = config.write().await;
                cfg.server.api_base_url = AppConfig::sanitize_url(&api_url);
                cfg.server.ws_url = AppConfig::sanitize_url(&ws_url);
            }
            config.snapshot().await.save_to_file(&path)?;
            match format {
                OutputFormat::Json => super::print_json(&json!({"written": path.display().to_string()})),
                OutputFormat::Text => {
                    println!("  {} Config written to {}", style("OK").green(), path.display())
                }
            }
        }
    }
    Ok(())
}
