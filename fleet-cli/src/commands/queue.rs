//! Offline queue commands.

use std::time::Duration;

use clap::Subcommand;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use uuid::Uuid;

use fleet_core::config::ConfigHandle;
use fleet_core::error::{FleetError, FleetResult};
use fleet_services::{ActionState, SubmitError, SubmitOutcome};

use crate::OutputFormat;

#[derive(Subcommand)]
pub enum QueueAction {
    /// List pending actions in replay order.
    List,
    /// Replay pending actions now.
    Drain,
    /// Delete every pending action.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },
    /// List actions the server refused.
    Rejected,
    /// Drop a rejected action.
    Dismiss {
        /// Action id.
        id: Uuid,
    },
    /// Move a rejected action back to the end of the queue.
    Retry {
        /// Action id.
        id: Uuid,
    },
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub async fn submit(
    config: ConfigHandle,
    kind: String,
    payload: String,
    format: OutputFormat,
) -> FleetResult<()> {
    let payload = super::parse_json_arg("payload", &payload)?;
    let runtime = super::open_runtime(&config).await?;
    let outcome = runtime.queue().submit(&kind, payload).await;
    runtime.shutdown().await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(SubmitError::Api(e)) => {
            match format {
                OutputFormat::Json => super::print_json(&json!({
                    "outcome": "refused",
                    "error": serde_json::to_value(&e)?,
                })),
                OutputFormat::Text => println!(
                    "  {} {kind} refused by {} {} ({} {}): {}",
                    style("ERROR").red().bold(),
                    e.method,
                    e.endpoint,
                    e.status,
                    e.code,
                    e.message
                ),
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    match (outcome, format) {
        (SubmitOutcome::Sent(response), OutputFormat::Json) => super::print_json(&json!({
            "outcome": "sent",
            "status": response.status,
        })),
        (SubmitOutcome::Queued(action), OutputFormat::Json) => super::print_json(&json!({
            "outcome": "queued",
            "id": action.id,
        })),
        (SubmitOutcome::Sent(response), OutputFormat::Text) => {
            println!("  {} {kind} sent ({})", style("OK").green().bold(), response.status);
        }
        (SubmitOutcome::Queued(action), OutputFormat::Text) => {
            println!(
                "  {} {kind} queued as {}; it will replay when the connection returns.",
                style("QUEUED").yellow().bold(),
                action.id
            );
        }
    }
    Ok(())
}

pub async fn run(config: ConfigHandle, action: QueueAction, format: OutputFormat) -> FleetResult<()> {
    let runtime = super::open_runtime(&config).await?;
    let result = run_action(&runtime, action, format).await;
    runtime.shutdown().await;
    result
}

async fn run_action(
    runtime: &fleet_services::ClientRuntime,
    action: QueueAction,
    format: OutputFormat,
) -> FleetResult<()> {
    let queue = runtime.queue();
    match action {
        QueueAction::List => {
            let entries = queue.list()?;
            match format {
                OutputFormat::Json => super::print_json(&serde_json::to_value(&entries)?),
                OutputFormat::Text if entries.is_empty() => println!("Queue is empty."),
                OutputFormat::Text => {
                    let mut table = table();
                    table.set_header(vec!["Id", "Kind", "Owner", "Created", "Attempts", "Payload"]);
                    for entry in &entries {
                        let a = &entry.action;
                        let kind = match entry.state {
                            ActionState::InFlight => format!("{} (sending)", a.kind),
                            ActionState::Pending => a.kind.clone(),
                        };
                        table.add_row(vec![
                            a.id.to_string(),
                            kind,
                            a.owner.clone().unwrap_or_else(|| "-".into()),
                            super::format_time(&a.created_at),
                            a.attempts.to_string(),
                            super::truncate(&a.payload.to_string(), 40),
                        ]);
                    }
                    println!("{table}");
                    println!("\n{} pending action(s)", entries.len());
                }
            }
        }
        QueueAction::Drain => {
            if !runtime.session().has_valid_credential() {
                return Err(FleetError::NotAuthenticated);
            }
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("  {spinner} [{elapsed_precise}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_message(format!("Replaying {} action(s)...", queue.size()?));
            pb.enable_steady_tick(Duration::from_millis(100));
            let report = queue.drain().await;
            pb.finish_and_clear();
            let report = report?;

            match format {
                OutputFormat::Json => super::print_json(&serde_json::to_value(&report)?),
                OutputFormat::Text => {
                    println!(
                        "  Replayed {}, rejected {}, {} remaining.",
                        style(report.replayed).green(),
                        style(report.rejected).red(),
                        report.remaining
                    );
                    if report.held > 0 {
                        println!(
                            "  {} action(s) were queued by another user and wait for their sign-in.",
                            report.held
                        );
                    }
                    if let Some(kind) = report.stopped_by {
                        println!(
                            "  {} stopped early ({kind:?}); remaining actions will replay later.",
                            style("WARN").yellow().bold()
                        );
                    }
                }
            }
        }
        QueueAction::Clear { yes } => {
            let size = queue.size()?;
            if size == 0 {
                println!("Queue is empty.");
                return Ok(());
            }
            let confirmed = yes
                || Confirm::new()
                    .with_prompt(format!("Delete {size} pending action(s)? They will never be sent"))
                    .default(false)
                    .interact()
                    .map_err(super::prompt_error)?;
            if !confirmed {
                println!("Aborted.");
                return Ok(());
            }
            let removed = queue.clear()?;
            match format {
                OutputFormat::Json => super::print_json(&json!({"removed": removed})),
                OutputFormat::Text => println!("  {} Removed {removed} action(s).", style("OK").green()),
            }
        }
        QueueAction::Rejected => {
            let rejected = queue.rejected()?;
            match format {
                OutputFormat::Json => super::print_json(&serde_json::to_value(&rejected)?),
                OutputFormat::Text if rejected.is_empty() => println!("No rejected actions."),
                OutputFormat::Text => {
                    let mut table = table();
                    table.set_header(vec!["Id", "Kind", "Status", "Reason", "Rejected"]);
                    for r in &rejected {
                        table.add_row(vec![
                            r.action.id.to_string(),
                            r.action.kind.clone(),
                            if r.status == 0 { "-".into() } else { r.status.to_string() },
                            super::truncate(&r.reason, 40),
                            super::format_time(&r.rejected_at),
                        ]);
                    }
                    println!("{table}");
                    println!("\nUse `fleet queue retry <id>` or `fleet queue dismiss <id>`.");
                }
            }
        }
        QueueAction::Dismiss { id } => {
            if !queue.dismiss_rejected(id)? {
                return Err(FleetError::Service(format!("no rejected action {id}")));
            }
            match format {
                OutputFormat::Json => super::print_json(&json!({"dismissed": id})),
                OutputFormat::Text => println!("  {} Dismissed {id}.", style("OK").green()),
            }
        }
        QueueAction::Retry { id } => {
            let Some(action) = queue.retry_rejected(id)? else {
                return Err(FleetError::Service(format!("no rejected action {id}")));
            };
            match format {
                OutputFormat::Json => super::print_json(&json!({"requeued": action.id})),
                OutputFormat::Text => println!(
                    "  {} {} requeued; it replays on the next drain.",
                    style("OK").green(),
                    action.id
                ),
            }
        }
    }
    Ok(())
}
