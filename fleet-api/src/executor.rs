//! Resilient execution of one logical HTTP operation.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use fleet_core::config::AppConfig;
use fleet_core::constants::IDEMPOTENCY_HEADER;
use fleet_core::session::AuthSessionStore;

use crate::error::{ApiError, ErrorKind};
use crate::refresh::TokenRefreshCoordinator;
use crate::response::{ApiResponse, HealthReport};
use crate::retry::{Classification, RetryContext, RetryDecision, RetryPolicy};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Let the server deduplicate replays of the same action.
    pub fn with_idempotency_key(self, id: Uuid) -> Self {
        self.with_header(IDEMPOTENCY_HEADER, id.to_string())
    }
}

/// Runs requests with bearer auth, bounded retry, and refresh-and-replay on 401.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
    session: AuthSessionStore,
    refresher: TokenRefreshCoordinator,
    policy: RetryPolicy,
    base_url: String,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        session: AuthSessionStore,
        refresher: TokenRefreshCoordinator,
        policy: RetryPolicy,
        base_url: &str,
    ) -> Self {
        Self {
            transport,
            session,
            refresher,
            policy,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Wire the executor and its refresh coordinator from configuration.
    pub fn from_config(
        config: &AppConfig,
        transport: Arc<dyn HttpTransport>,
        session: AuthSessionStore,
    ) -> Self {
        let refresher = TokenRefreshCoordinator::new(
            session.clone(),
            Arc::clone(&transport),
            &config.server.api_base_url,
        );
        Self::new(
            transport,
            session,
            refresher,
            RetryPolicy::from_config(&config.retry),
            &config.server.api_base_url,
        )
    }

    pub fn refresher(&self) -> &TokenRefreshCoordinator {
        &self.refresher
    }

    /// The session whose bearer token is attached to requests.
    pub fn session(&self) -> &AuthSessionStore {
        &self.session
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Execute one logical operation.
    ///
    /// Transient failures are retried per the policy; a 401 triggers one
    /// refresh and one replay that does not count against the retry budget.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut ctx = RetryContext::new();
        let mut replayed_after_refresh = false;

        loop {
            let response = match self.transport.send(self.build(&request)).await {
                Ok(response) => response,
                Err(e) => {
                    self.backoff_or_fail(&mut ctx, &request, ErrorKind::Network, 0, e.to_string())
                        .await?;
                    continue;
                }
            };

            let status = response.status;
            let classification = Classification::from_status(status);
            match classification {
                Classification::Success => {
                    if ctx.attempt > 0 || replayed_after_refresh {
                        debug!(
                            "{} {} succeeded after {} retr(ies)",
                            request.method, request.path, ctx.attempt
                        );
                    }
                    return Ok(ApiResponse {
                        status,
                        body: response.body,
                        method: request.method,
                        endpoint: request.path,
                    });
                }
                Classification::AuthExpired if !replayed_after_refresh => {
                    debug!("{} {} returned 401, refreshing token", request.method, request.path);
                    if let Err(e) = self.refresher.refresh().await {
                        return Err(self.terminal(&request, ErrorKind::RefreshFailed, status, e.to_string()));
                    }
                    replayed_after_refresh = true;
                }
                Classification::AuthExpired => {
                    warn!("{} {} still unauthorized after refresh", request.method, request.path);
                    return Err(self.terminal(
                        &request,
                        ErrorKind::AuthExpired,
                        status,
                        error_message(&response),
                    ));
                }
                Classification::NonRetryableError => {
                    return Err(self.terminal(
                        &request,
                        ErrorKind::NonRetryableClient,
                        status,
                        error_message(&response),
                    ));
                }
                Classification::RetryableServerError | Classification::NetworkError => {
                    let kind = classification
                        .error_kind()
                        .unwrap_or(ErrorKind::RetryableServer);
                    self.backoff_or_fail(
                        &mut ctx,
                        &request,
                        kind,
                        status,
                        error_message(&response),
                    )
                    .await?;
                }
            }
        }
    }

    /// Sleep before the next retry, or return the terminal error once the
    /// policy gives up.
    async fn backoff_or_fail(
        &self,
        ctx: &mut RetryContext,
        request: &ApiRequest,
        kind: ErrorKind,
        status: u16,
        message: String,
    ) -> Result<(), ApiError> {
        ctx.record(kind);
        match self.policy.decide(ctx) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    "retrying {} {} (attempt {}/{}) after {:.1}s: {message}",
                    request.method,
                    request.path,
                    ctx.attempt + 2,
                    self.policy.max_retries + 1,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                ctx.attempt += 1;
                Ok(())
            }
            RetryDecision::GiveUp => {
                warn!(
                    "{} {} failed after {} attempt(s) in {}ms",
                    request.method,
                    request.path,
                    ctx.attempt + 1,
                    ctx.elapsed_ms
                );
                Err(self.terminal(request, kind, status, message))
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::put(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::delete(path)).await
    }

    /// GET and decode the body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get(path).await?.json()
    }

    /// Per-service status from `GET /health`.
    pub async fn health(&self) -> Result<HealthReport, ApiError> {
        self.get_json("/health").await
    }

    /// Resolve the request, reading the bearer token at send time.
    fn build(&self, request: &ApiRequest) -> HttpRequest {
        let mut headers = Vec::with_capacity(request.headers.len() + 2);
        if let Some(token) = self.session.access_token() {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        if request.body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }
        headers.extend(request.headers.iter().cloned());

        HttpRequest {
            method: request.method.clone(),
            url: format!("{}{}", self.base_url, request.path),
            headers,
            body: request.body.clone(),
        }
    }

    fn terminal(&self, request: &ApiRequest, kind: ErrorKind, status: u16, message: String) -> ApiError {
        ApiError::new(kind, request.method.clone(), request.path.clone(), status, message)
    }
}

/// Best-effort message from an error response body.
fn error_message(response: &HttpResponse) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&response.body) {
        if let Some(msg) = value
            .get("message")
            .or_else(|| value.get("error"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    if response.body.trim().is_empty() {
        format!("server returned {}", response.status)
    } else {
        response.body.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockHttpTransport, MockReply};
    use fleet_core::session::Credential;
    use fleet_core::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::Instant;

    struct Harness {
        transport: Arc<MockHttpTransport>,
        session: AuthSessionStore,
        executor: RequestExecutor,
    }

    fn harness() -> Harness {
        let transport = Arc::new(MockHttpTransport::new());
        let session = AuthSessionStore::load(Arc::new(MemoryStore::new())).unwrap();
        session.set(Credential::new("token-1", "refresh-1", "driver-1")).unwrap();
        let mut config = AppConfig::default();
        config.server.api_base_url = "https://api.test/api".into();
        let executor = RequestExecutor::from_config(&config, transport.clone(), session.clone());
        Harness {
            transport,
            session,
            executor,
        }
    }

    fn gaps(requests: &[crate::testing::RecordedRequest]) -> Vec<u128> {
        requests
            .windows(2)
            .map(|w| (w[1].at - w[0].at).as_millis())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_statuses_retry_with_increasing_delay() {
        for status in [408u16, 429, 500, 502, 503, 504] {
            let h = harness();
            h.transport.push_n("/vehicles", MockReply::status(status), 4);

            let err = h.executor.get("/vehicles").await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::RetryableServer);
            assert_eq!(err.status, status);
            assert_eq!(err.code, "SERVER_ERROR");

            let sent = h.transport.requests_to("/vehicles");
            assert_eq!(sent.len(), 4, "status {status}");
            assert_eq!(gaps(&sent), vec![1_000, 2_000, 4_000]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_retried() {
        let h = harness();
        h.transport.push("/trips/99", MockReply::Status(404, r#"{"message":"trip not found"}"#.into()));

        let err = h.executor.get("/trips/99").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NonRetryableClient);
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "trip not found");
        assert_eq!(err.endpoint, "/trips/99");
        assert_eq!(err.method, Method::GET);
        assert!(!err.retryable);
        assert_eq!(h.transport.count("/trips/99"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_exhaust_after_four_attempts() {
        let h = harness();
        h.transport.push_n("/vehicles", MockReply::NetworkError, 4);

        let started = Instant::now();
        let err = h
            .executor
            .post("/vehicles", json!({"plate": "FL-001"}))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Network);
        assert_eq!(err.status, 0);
        assert_eq!(err.method, Method::POST);
        assert_eq!(h.transport.count("/vehicles"), 4);
        assert_eq!(started.elapsed(), Duration::from_millis(7_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let h = harness();
        h.transport
            .push("/vehicles", MockReply::NetworkError)
            .push("/vehicles", MockReply::status(503))
            .push("/vehicles", MockReply::ok(r#"[{"id":1}]"#));

        let vehicles: serde_json::Value = h.executor.get_json("/vehicles").await.unwrap();
        assert_eq!(vehicles[0]["id"], 1);
        assert_eq!(h.transport.count("/vehicles"), 3);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_replays_once() {
        let h = harness();
        h.transport
            .push("/trips", MockReply::status(401))
            .push("/trips", MockReply::ok(r#"{"ok":true}"#))
            .push("/auth/refresh", MockReply::ok(r#"{"token":"token-2"}"#));

        let response = h.executor.get("/trips").await.unwrap();
        assert_eq!(response.status, 200);

        let sent = h.transport.requests_to("/trips");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].header("Authorization"), Some("Bearer token-1"));
        assert_eq!(sent[1].header("Authorization"), Some("Bearer token-2"));
        assert_eq!(h.transport.count("/auth/refresh"), 1);
        assert_eq!(h.session.access_token().as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn test_second_401_is_terminal() {
        let h = harness();
        h.transport
            .push_n("/trips", MockReply::status(401), 2)
            .push("/auth/refresh", MockReply::ok(r#"{"token":"token-2"}"#));

        let err = h.executor.get("/trips").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthExpired);
        assert_eq!(h.transport.count("/trips"), 2);
        assert_eq!(h.transport.count("/auth/refresh"), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_surfaces_session_invalid() {
        let h = harness();
        let mut ended = h.executor.refresher().session_events();
        h.transport
            .push("/trips", MockReply::status(401))
            .push("/auth/refresh", MockReply::status(401));

        let err = h.executor.get("/trips").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RefreshFailed);
        assert_eq!(err.code, "SESSION_INVALID");
        assert!(err.is_session_error());
        assert_eq!(h.transport.count("/trips"), 1);
        assert!(h.session.get().is_none());
        assert!(ended.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_replay_does_not_consume_retry_slot() {
        let h = harness();
        h.transport
            .push("/trips", MockReply::status(503))
            .push("/trips", MockReply::status(401))
            .push_n("/trips", MockReply::status(503), 3)
            .push("/auth/refresh", MockReply::ok(r#"{"token":"token-2"}"#));

        let err = h.executor.get("/trips").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RetryableServer);
        // initial + 3 retries + 1 replay
        assert_eq!(h.transport.count("/trips"), 5);
    }

    #[tokio::test]
    async fn test_headers_and_health() {
        let h = harness();
        h.transport.push(
            "/health",
            MockReply::ok(r#"{"services":{"database":true,"telemetry":true}}"#),
        );
        let report = h.executor.health().await.unwrap();
        assert!(report.all_healthy());

        let id = Uuid::new_v4();
        h.executor
            .execute(ApiRequest::post("/trips/start", json!({"tripId": 3})).with_idempotency_key(id))
            .await
            .unwrap();
        let sent = &h.transport.requests_to("/trips/start")[0];
        assert_eq!(sent.url, "https://api.test/api/trips/start");
        assert_eq!(sent.header("Idempotency-Key"), Some(id.to_string().as_str()));
        assert_eq!(sent.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_unauthenticated_request_has_no_bearer() {
        let h = harness();
        h.session.clear().unwrap();
        h.executor.get("/public/status").await.unwrap();
        let sent = &h.transport.requests_to("/public/status")[0];
        assert!(sent.header("Authorization").is_none());
    }
}
