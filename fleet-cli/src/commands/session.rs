//! Login and logout.

use std::time::Duration;

use console::style;
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

use fleet_core::config::ConfigHandle;
use fleet_core::error::FleetResult;
use fleet_core::session::Credential;
use fleet_socket::ConnectionState;

use crate::OutputFormat;

pub struct LoginArgs {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub user_type: Option<String>,
}

fn prompt_text(value: Option<String>, prompt: &str) -> FleetResult<String> {
    match value {
        Some(v) => Ok(v),
        None => Input::new()
            .with_prompt(prompt)
            .interact_text()
            .map_err(super::prompt_error),
    }
}

fn prompt_secret(value: Option<String>, prompt: &str) -> FleetResult<String> {
    match value {
        Some(v) => Ok(v),
        None => Password::new()
            .with_prompt(prompt)
            .interact()
            .map_err(super::prompt_error),
    }
}

pub async fn login(config: ConfigHandle, args: LoginArgs, format: OutputFormat) -> FleetResult<()> {
    let user_id = prompt_text(args.user_id, "User id")?;
    let access = prompt_secret(args.access_token, "Access token")?;
    let refresh = prompt_secret(args.refresh_token, "Refresh token")?;

    let user_type = match args.user_type {
        Some(t) => Some(t),
        None => config.read().await.server.user_type.clone(),
    };
    let mut credential = Credential::new(access, refresh, user_id);
    if let Some(t) = user_type {
        credential = credential.with_user_type(t);
    }

    let runtime = super::open_runtime(&config).await?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("  {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message("Connecting...");
    pb.enable_steady_tick(Duration::from_millis(100));

    runtime.login(credential).await?;
    let mut state_rx = runtime.connection().state_receiver();
    let settled = tokio::time::timeout(
        Duration::from_secs(20),
        state_rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed)),
    )
    .await;
    pb.finish_and_clear();

    let state = match settled {
        Ok(Ok(state)) => *state,
        _ => runtime.connection().state(),
    };
    runtime.shutdown().await;

    match format {
        OutputFormat::Json => super::print_json(&json!({
            "signed_in": true,
            "connection": state,
        })),
        OutputFormat::Text => {
            println!("  {} Credential stored.", style("OK").green().bold());
            if state == ConnectionState::Connected {
                println!("  {} Realtime connection verified.", style("OK").green().bold());
            } else {
                println!(
                    "  {} Realtime connection is {state}; actions will queue until it recovers.",
                    style("WARN").yellow().bold()
                );
            }
        }
    }
    Ok(())
}

pub async fn logout(config: ConfigHandle, format: OutputFormat) -> FleetResult<()> {
    let runtime = super::open_runtime(&config).await?;
    runtime.logout().await?;
    let pending = runtime.queue().size()?;
    runtime.shutdown().await;

    match format {
        OutputFormat::Json => super::print_json(&json!({
            "signed_in": false,
            "pending_actions": pending,
        })),
        OutputFormat::Text => {
            println!("  {} Signed out.", style("OK").green().bold());
            if pending > 0 {
                println!("  {pending} queued action(s) will replay after the next login.");
            }
        }
    }
    Ok(())
}
