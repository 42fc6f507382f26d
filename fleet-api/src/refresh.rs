//! Single-flight access-token refresh.
//!
//! Concurrent callers of [`TokenRefreshCoordinator::refresh`] share one
//! in-flight operation: the first caller spawns the refresh task and parks a
//! shared handle to it; later callers clone that handle. The task writes the
//! new token to the session store before it completes, so no waiter is
//! released before the rotation is visible. On failure the session is
//! cleared and [`SessionEnded`] is broadcast; reacting to it (routing to a
//! sign-in screen, tearing down the socket) is the host's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fleet_core::session::AuthSessionStore;

use crate::response::RefreshResponse;
use crate::transport::{HttpRequest, HttpTransport};

/// Path of the refresh endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Outcome of a failed refresh flight. Every waiter receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("refresh request failed: {0}")]
    Transport(String),
    #[error("refresh rejected with status {0}")]
    Rejected(u16),
    #[error("refresh response carried no token")]
    MissingToken,
    #[error("failed to store refreshed token: {0}")]
    Storage(String),
}

/// Broadcast when the session can no longer be renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnded {
    pub reason: String,
}

type Flight = Shared<BoxFuture<'static, Result<(), RefreshError>>>;

struct Inner {
    session: AuthSessionStore,
    transport: Arc<dyn HttpTransport>,
    refresh_url: String,
    in_flight: Mutex<Option<Flight>>,
    session_tx: broadcast::Sender<SessionEnded>,
    refresh_count: AtomicU64,
}

/// Cloneable handle; all clones share the same in-flight slot.
#[derive(Clone)]
pub struct TokenRefreshCoordinator {
    inner: Arc<Inner>,
}

impl TokenRefreshCoordinator {
    pub fn new(
        session: AuthSessionStore,
        transport: Arc<dyn HttpTransport>,
        api_base_url: &str,
    ) -> Self {
        let (session_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                session,
                transport,
                refresh_url: format!("{}{REFRESH_PATH}", api_base_url.trim_end_matches('/')),
                in_flight: Mutex::new(None),
                session_tx,
                refresh_count: AtomicU64::new(0),
            }),
        }
    }

    /// Refresh the access token, joining the current flight if one is running.
    pub async fn refresh(&self) -> Result<(), RefreshError> {
        let flight = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(flight) => {
                    debug!("joining in-flight token refresh");
                    flight.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let outcome = inner.run().await;
                        // Clear before waiters wake so the next expiry starts a new flight.
                        *inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
                        outcome
                    });
                    let flight: Flight = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(RefreshError::Transport(format!("refresh task aborted: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Subscribe to session-ended signals.
    pub fn session_events(&self) -> broadcast::Receiver<SessionEnded> {
        self.inner.session_tx.subscribe()
    }

    /// Number of refresh requests sent so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_count.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Inner {
    async fn run(&self) -> Result<(), RefreshError> {
        match self.exchange().await {
            Ok(()) => {
                info!("access token refreshed");
                Ok(())
            }
            Err(e) => {
                error!("token refresh failed: {e}");
                if let Err(clear_err) = self.session.clear() {
                    warn!("failed to clear session after refresh failure: {clear_err}");
                }
                // No receivers is fine; the host may not be listening yet.
                let _ = self.session_tx.send(SessionEnded {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn exchange(&self) -> Result<(), RefreshError> {
        let refresh_token = self
            .session
            .refresh_token()
            .ok_or(RefreshError::NoRefreshToken)?;

        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        let request = HttpRequest {
            method: Method::POST,
            url: self.refresh_url.clone(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(serde_json::json!({ "refreshToken": refresh_token })),
        };

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !(200..300).contains(&response.status) {
            return Err(RefreshError::Rejected(response.status));
        }

        let parsed: RefreshResponse =
            serde_json::from_str(&response.body).map_err(|_| RefreshError::MissingToken)?;
        let token = parsed
            .token
            .filter(|t| !t.is_empty())
            .ok_or(RefreshError::MissingToken)?;

        self.session
            .set_access_token(&token, parsed.refresh_token.as_deref())
            .map_err(|e| RefreshError::Storage(e.to_string()))
    }
}
