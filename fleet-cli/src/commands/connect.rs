//! Connect command - hold the realtime connection open and stream events.

use console::style;
use tokio::sync::broadcast::error::RecvError;

use fleet_core::config::ConfigHandle;
use fleet_core::error::{FleetError, FleetResult};
use fleet_services::AppEvent;
use fleet_socket::{FrameKind, InboundFrame};

use crate::OutputFormat;

fn print_frame(frame: &InboundFrame, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({"frame": frame.kind.as_str(), "payload": frame.payload})
        ),
        OutputFormat::Text => println!(
            "  {} {}",
            style(format!("[{}]", frame.kind)).cyan(),
            frame.payload
        ),
    }
}

fn print_event(event: &AppEvent, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event).unwrap_or_default()),
        OutputFormat::Text => {
            let label = style(format!("[{}]", event.label())).magenta();
            match event {
                AppEvent::ConnectionStateChanged { state } => println!("  {label} {state}"),
                AppEvent::QueueDrained {
                    replayed,
                    rejected,
                    remaining,
                } => println!("  {label} {replayed} replayed, {rejected} rejected, {remaining} remaining"),
                AppEvent::ActionRejected { kind, reason, status, .. } => {
                    println!("  {label} {kind}: {reason} ({status})")
                }
                AppEvent::CriticalAlert { alert } => println!(
                    "  {label} {} {}",
                    style(&alert.title).red().bold(),
                    alert.message
                ),
                other => println!("  {label} {}", serde_json::to_string(other).unwrap_or_default()),
            }
        }
    }
}

pub async fn run(config: ConfigHandle, topics: Vec<String>, format: OutputFormat) -> FleetResult<()> {
    let runtime = super::open_runtime(&config).await?;
    if !runtime.session().has_valid_credential() {
        return Err(FleetError::NotAuthenticated);
    }

    for topic in topics {
        runtime.connection().acquire_topic(topic);
    }
    let dispatcher = runtime.connection().dispatcher();
    for kind in [
        FrameKind::VehicleUpdate,
        FrameKind::TripUpdate,
        FrameKind::FleetAlert,
        FrameKind::Notification,
        FrameKind::Error,
    ] {
        dispatcher.on(kind, move |frame| {
            print_frame(frame, format);
            Ok(())
        });
    }

    let mut events = runtime.events().subscribe();
    runtime.connect().await;
    if let OutputFormat::Text = format {
        println!("  Listening for events... (Ctrl+C to stop)");
        println!();
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let session_over = matches!(event, AppEvent::SessionEnded { .. });
                    print_event(&event, format);
                    if session_over {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    println!("  {} Missed {n} events (slow consumer)", style("WARN").yellow());
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if let OutputFormat::Text = format {
                    println!("\n  Disconnecting...");
                }
                break;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}
