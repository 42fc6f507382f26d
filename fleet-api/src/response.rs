//! Response types.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ErrorKind};

/// Successful (status < 400) response to a logical request.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
    pub method: Method,
    pub endpoint: String,
}

impl ApiResponse {
    /// Decode the body. An empty body decodes as JSON `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        let raw = if self.body.trim().is_empty() { "null" } else { &self.body };
        serde_json::from_str(raw).map_err(|e| {
            ApiError::new(
                ErrorKind::InvalidResponse,
                self.method.clone(),
                self.endpoint.clone(),
                self.status,
                format!("failed to parse response: {e}"),
            )
        })
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub services: BTreeMap<String, bool>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.services.values().all(|ok| *ok)
    }

    /// Names of the services reporting down.
    pub fn unhealthy(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RefreshResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "refreshToken")]
    pub refresh_token: Option<String>,
}
