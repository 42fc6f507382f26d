//! Request command - one API call through the retrying executor.

use console::style;
use serde_json::json;

use fleet_api::{ApiRequest, Method};
use fleet_core::config::ConfigHandle;
use fleet_core::error::{FleetError, FleetResult};

use crate::OutputFormat;

pub async fn run(
    config: ConfigHandle,
    method: String,
    path: String,
    body: Option<String>,
    format: OutputFormat,
) -> FleetResult<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|_| FleetError::Config(format!("invalid HTTP method: {method}")))?;
    let mut request = ApiRequest::new(method, path);
    if let Some(raw) = body {
        request = request.with_body(super::parse_json_arg("body", &raw)?);
    }

    let runtime = super::open_runtime(&config).await?;
    let result = runtime.executor().execute(request).await;
    runtime.shutdown().await;

    let response = result?;
    let parsed: Option<serde_json::Value> = serde_json::from_str(response.text()).ok();
    match format {
        OutputFormat::Json => super::print_json(&json!({
            "status": response.status,
            "body": parsed.unwrap_or_else(|| json!(response.text())),
        })),
        OutputFormat::Text => {
            println!(
                "  {} {} {}",
                style(response.status).green().bold(),
                response.method,
                response.endpoint
            );
            match parsed {
                Some(value) => super::print_json(&value),
                None if !response.text().is_empty() => println!("{}", response.text()),
                None => {}
            }
        }
    }
    Ok(())
}
