//! Status and health commands.

use std::time::Instant;

use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use console::style;
use serde_json::json;

use fleet_core::config::ConfigHandle;
use fleet_core::error::FleetResult;
use fleet_core::logging::redact_url;
use fleet_services::ServiceState;

use crate::OutputFormat;

/// Local status only; does not open the socket.
pub async fn run(config: ConfigHandle, format: OutputFormat) -> FleetResult<()> {
    let runtime = super::open_runtime(&config).await?;
    let cfg = runtime.config();
    let credential = runtime.session().get();
    let pending = runtime.queue().size()?;
    let rejected = runtime.queue().rejected()?.len();
    let indicator = runtime.indicator();

    match format {
        OutputFormat::Json => super::print_json(&json!({
            "api_base_url": redact_url(&cfg.server.api_base_url),
            "ws_url": redact_url(&cfg.server.ws_url),
            "signed_in": credential.is_some(),
            "user_id": credential.as_ref().map(|c| c.user_id.clone()),
            "connection": runtime.connection().state(),
            "indicator": indicator.to_string(),
            "pending_actions": pending,
            "rejected_actions": rejected,
        })),
        OutputFormat::Text => {
            println!("{}", style("Server").bold().underlined());
            println!("  API:        {}", redact_url(&cfg.server.api_base_url));
            println!("  Socket:     {}", redact_url(&cfg.server.ws_url));
            println!();
            println!("{}", style("Session").bold().underlined());
            match &credential {
                Some(c) => {
                    println!("  User:       {}", c.user_id);
                    if let Some(t) = &c.user_type {
                        println!("  Type:       {t}");
                    }
                    println!("  Issued:     {}", super::format_time(&c.issued_at));
                }
                None => println!("  {}", style("signed out").yellow()),
            }
            println!();
            println!("{}", style("Offline Queue").bold().underlined());
            println!("  Pending:    {pending}");
            println!(
                "  Rejected:   {}",
                if rejected > 0 {
                    style(rejected.to_string()).red().to_string()
                } else {
                    "0".to_string()
                }
            );
            println!("  Indicator:  {indicator}");
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn state_cell(state: ServiceState) -> String {
    match state {
        ServiceState::Running => style("running").green().to_string(),
        ServiceState::Degraded => style("degraded").yellow().to_string(),
        ServiceState::Failed => style("failed").red().to_string(),
        other => style(format!("{other:?}").to_lowercase()).dim().to_string(),
    }
}

pub async fn health(config: ConfigHandle, format: OutputFormat) -> FleetResult<()> {
    let runtime = super::open_runtime(&config).await?;
    let components = runtime.health();

    let start = Instant::now();
    let server = runtime.api_health().await;
    let latency_ms = start.elapsed().as_millis();

    match format {
        OutputFormat::Json => {
            let server = match &server {
                Ok(report) => json!({
                    "reachable": true,
                    "latency_ms": latency_ms,
                    "all_healthy": report.all_healthy(),
                    "services": report.services,
                }),
                Err(e) => json!({"reachable": false, "error": e.to_string()}),
            };
            super::print_json(&json!({
                "components": components,
                "server": server,
            }));
        }
        OutputFormat::Text => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["Component", "State", "Detail"]);
            for c in &components {
                table.add_row(vec![c.name.to_string(), state_cell(c.state), c.detail.clone()]);
            }
            println!("{}", style("Client").bold().underlined());
            println!("{table}");
            println!();

            println!("{}", style("Server").bold().underlined());
            match &server {
                Ok(report) => {
                    println!("  Reachable:  {} ({latency_ms}ms)", style("yes").green());
                    for (name, ok) in &report.services {
                        let mark = if *ok {
                            style("up").green()
                        } else {
                            style("down").red()
                        };
                        println!("  {name:<12}{mark}");
                    }
                    let down = report.unhealthy();
                    if !down.is_empty() {
                        println!(
                            "  {} degraded: {}",
                            style("WARN").yellow().bold(),
                            down.join(", ")
                        );
                    }
                }
                Err(e) => println!("  {} {e}", style("FAIL").red().bold()),
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
