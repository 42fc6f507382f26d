//! Global error types for the FleetOps client.
//!
//! All non-HTTP error categories are unified into a single `FleetError`
//! enum with conversions from underlying library errors. HTTP operations
//! return the richer `ApiError` from `fleet-api`, which converts into
//! `FleetError::Api` when it crosses into code that only needs a message.

use thiserror::Error;

/// Convenience type alias for Results using FleetError.
pub type FleetResult<T> = Result<T, FleetError>;

/// Unified error type covering all error categories in the client.
#[derive(Error, Debug)]
pub enum FleetError {
    // -- Configuration errors --
    /// Failed to load or parse application configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required configuration value is missing.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    // -- Storage errors --
    /// SQLite database error.
    #[error("database error: {0}")]
    Database(String),

    /// Database migration failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database connection pool error.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// Database integrity check failed.
    #[error("database integrity check failed: {0}")]
    IntegrityCheck(String),

    // -- Network errors --
    /// HTTP request failed. Carries the rendered `ApiError`; callers that
    /// need its fields keep the `ApiError` itself.
    #[error("api error: {0}")]
    Api(String),

    /// WebSocket transport error.
    #[error("socket error: {0}")]
    Socket(String),

    /// An outbound frame was offered while the channel is not open.
    #[error("not connected")]
    NotConnected,

    /// Automatic reconnection gave up after the configured attempt count.
    #[error("max reconnect attempts exceeded ({0})")]
    MaxReconnectAttempts(u32),

    // -- Session errors --
    /// No usable credential is stored.
    #[error("not authenticated")]
    NotAuthenticated,

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Service errors --
    /// A service operation failed.
    #[error("service error: {0}")]
    Service(String),

    // -- Notification errors --
    /// Desktop notification failed.
    #[error("notification error: {0}")]
    Notification(String),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// Wrapping anyhow errors for interop.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(e: toml::de::Error) -> Self {
        FleetError::Config(e.to_string())
    }
}
