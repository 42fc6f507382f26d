//! Production HTTP transport over reqwest.
//!
//! Owns connection pooling, timeouts, and the static headers configured for
//! every request. Retry and auth live in the executor, not here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::{debug, warn};

use fleet_core::config::ServerConfig;
use fleet_core::constants;
use fleet_core::error::{FleetError, FleetResult};

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// [`HttpTransport`] backed by a pooled `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestTransport {
    inner: Client,
}

impl ReqwestTransport {
    pub fn new(config: &ServerConfig) -> FleetResult<Self> {
        let mut default_headers = HeaderMap::new();
        for (key, value) in &config.custom_headers {
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    default_headers.insert(name, value);
                }
                _ => warn!("ignoring invalid custom header {key:?}"),
            }
        }

        let inner = Client::builder()
            .timeout(config.api_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(format!("{}/{}", constants::APP_NAME, constants::APP_VERSION))
            .default_headers(default_headers)
            .build()
            .map_err(|e| FleetError::Api(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { inner })
    }

    /// Map a reqwest error to a transport failure.
    fn classify_error(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.inner.request(request.method.clone(), &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(Self::classify_error)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(Self::classify_error)?;
        debug!("{} -> {status} ({} bytes)", request.method, body.len());

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_build_with_custom_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-Fleet-Tenant".to_string(), "acme".to_string());
        headers.insert("bad header".to_string(), "x".to_string());
        let config = ServerConfig {
            custom_headers: headers,
            ..ServerConfig::default()
        };
        assert!(ReqwestTransport::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let transport = ReqwestTransport::new(&ServerConfig {
            connect_timeout_ms: 500,
            ..ServerConfig::default()
        })
        .unwrap();
        let result = transport
            .send(HttpRequest {
                method: reqwest::Method::GET,
                url: "http://127.0.0.1:1/health".into(),
                headers: Vec::new(),
                body: None,
            })
            .await;
        assert!(result.is_err());
    }
}
