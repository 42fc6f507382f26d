//! Typed HTTP errors returned to callers of the executor.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use thiserror::Error;

use fleet_core::error::FleetError;

/// Failure categories for HTTP operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No response was obtained.
    Network,
    /// 401 that refresh-and-replay could not absorb.
    AuthExpired,
    /// 408, 429, 500, 502, 503, 504 after retries ran out.
    RetryableServer,
    /// Any other status >= 400.
    NonRetryableClient,
    /// The refresh endpoint failed or returned no token. The session is over.
    RefreshFailed,
    /// A success response whose body could not be decoded.
    InvalidResponse,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK_ERROR",
            ErrorKind::AuthExpired => "AUTH_EXPIRED",
            ErrorKind::RetryableServer => "SERVER_ERROR",
            ErrorKind::NonRetryableClient => "CLIENT_ERROR",
            ErrorKind::RefreshFailed => "SESSION_INVALID",
            ErrorKind::InvalidResponse => "INVALID_RESPONSE",
        }
    }

    /// Whether the retry policy treats this kind as transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::RetryableServer)
    }
}

/// Terminal error for one logical request.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{method} {endpoint} failed [{code}] (status {status}): {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status, 0 when no response was obtained.
    pub status: u16,
    pub code: &'static str,
    pub timestamp: DateTime<Utc>,
    /// Informational; the retry decision has already been made.
    pub retryable: bool,
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub endpoint: String,
}

fn serialize_method<S: serde::Serializer>(method: &Method, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(method.as_str())
}

impl ApiError {
    pub fn new(
        kind: ErrorKind,
        method: Method,
        endpoint: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            status,
            code: kind.code(),
            timestamp: Utc::now(),
            retryable: kind.is_transient(),
            method,
            endpoint: endpoint.into(),
        }
    }

    /// The request needs the user to sign in again.
    pub fn is_session_error(&self) -> bool {
        matches!(self.kind, ErrorKind::RefreshFailed | ErrorKind::AuthExpired)
    }

    /// The failure came from lack of connectivity rather than the request itself.
    pub fn is_connectivity(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<ApiError> for FleetError {
    fn from(e: ApiError) -> Self {
        FleetError::Api(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context() {
        let err = ApiError::new(ErrorKind::Network, Method::POST, "/vehicles", 0, "connection refused");
        assert_eq!(err.code, "NETWORK_ERROR");
        assert!(err.retryable);
        assert_eq!(
            err.to_string(),
            "POST /vehicles failed [NETWORK_ERROR] (status 0): connection refused"
        );
    }

    #[test]
    fn test_non_retryable_flags() {
        let err = ApiError::new(ErrorKind::NonRetryableClient, Method::GET, "/trips/9", 404, "not found");
        assert!(!err.retryable);
        assert!(!err.is_connectivity());
        assert!(!err.is_session_error());

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["kind"], "non_retryable_client");
        assert_eq!(json["code"], "CLIENT_ERROR");
    }

    #[test]
    fn test_into_fleet_error() {
        let err: FleetError =
            ApiError::new(ErrorKind::RefreshFailed, Method::GET, "/me", 401, "expired").into();
        assert!(err.to_string().contains("SESSION_INVALID"));
    }
}
