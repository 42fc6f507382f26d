//! Application-wide constants.

/// Application name.
pub const APP_NAME: &str = "FleetOps";

/// Application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server API timeout in milliseconds.
pub const DEFAULT_API_TIMEOUT_MS: u64 = 30_000;

/// SQLite database file name under the data directory.
pub const DB_FILE_NAME: &str = "fleetops.db";

/// Rolling log file prefix.
pub const LOG_FILE_NAME: &str = "fleetops.log";

/// Database schema version.
pub const DB_SCHEMA_VERSION: i32 = 3;

/// Storage key holding the serialized credential.
pub const SESSION_KEY: &str = "session.credential";

/// Header carrying the replayed action's id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// WebSocket close codes.
pub mod close_codes {
    /// Deliberate, normal closure. Never retried.
    pub const NORMAL: u16 = 1000;
    /// Connection dropped without a close frame.
    pub const ABNORMAL: u16 = 1006;
}

/// Environment variable names that override the config file.
pub mod env {
    pub const API_URL: &str = "FLEET_API_URL";
    pub const WS_URL: &str = "FLEET_WS_URL";
    pub const MAX_RECONNECT_ATTEMPTS: &str = "FLEET_MAX_RECONNECT_ATTEMPTS";
    pub const MAX_RETRIES: &str = "FLEET_MAX_RETRIES";
    pub const RETRY_DELAY_MS: &str = "FLEET_RETRY_DELAY_MS";
    pub const BACKOFF_MULTIPLIER: &str = "FLEET_BACKOFF_MULTIPLIER";
    pub const LOG_LEVEL: &str = "FLEET_LOG_LEVEL";

    /// All recognized override variables.
    pub const ALL: &[&str] = &[
        API_URL,
        WS_URL,
        MAX_RECONNECT_ATTEMPTS,
        MAX_RETRIES,
        RETRY_DELAY_MS,
        BACKOFF_MULTIPLIER,
        LOG_LEVEL,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_names_are_prefixed() {
        assert_eq!(env::ALL.len(), 7);
        assert!(env::ALL.iter().all(|name| name.starts_with("FLEET_")));
    }
}
