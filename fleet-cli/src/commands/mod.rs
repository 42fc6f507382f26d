//! CLI command implementations.

pub mod config;
pub mod connect;
pub mod queue;
pub mod request;
pub mod session;
pub mod status;

use chrono::{DateTime, Local, Utc};
use serde_json::Value;

use fleet_core::config::ConfigHandle;
use fleet_core::error::{FleetError, FleetResult};
use fleet_services::ClientRuntime;

/// Build the runtime from config: SQLite storage, real transports.
pub async fn open_runtime(config: &ConfigHandle) -> FleetResult<ClientRuntime> {
    let config = config.snapshot().await;
    if !config.is_server_configured() {
        return Err(FleetError::MissingConfig(
            "server endpoints; run `fleet config init --api-url <URL> --ws-url <URL>`".into(),
        ));
    }
    ClientRuntime::init_default(config).await
}

pub fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

/// Parse a JSON argument, naming the argument in the error.
pub fn parse_json_arg(name: &str, raw: &str) -> FleetResult<Value> {
    serde_json::from_str(raw)
        .map_err(|e| FleetError::Config(format!("{name} is not valid JSON: {e}")))
}

pub fn format_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Map an interactive prompt failure.
pub fn prompt_error(e: dialoguer::Error) -> FleetError {
    FleetError::Internal(e.to_string())
}

/// Truncate a string to a maximum length, appending an ellipsis if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a long payload body", 10), "a long ...");
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg("payload", r#"{"a":1}"#).unwrap()["a"], 1);
        let err = parse_json_arg("payload", "{oops").unwrap_err();
        assert!(err.to_string().contains("payload is not valid JSON"));
    }
}
