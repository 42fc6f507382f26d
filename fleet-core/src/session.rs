//! Credential ownership.
//!
//! [`AuthSessionStore`] is the only place access and refresh tokens live.
//! Every consumer (HTTP executor, refresh coordinator, socket URL builder)
//! reads the current token at the point of use instead of keeping a copy,
//! so a rotation is seen everywhere on the next read.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::SESSION_KEY;
use crate::error::{FleetError, FleetResult};
use crate::storage::KeyValueStore;

/// Access/refresh token pair for the signed-in user.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
    /// Stable client identifier sent as `userId` on the socket URL.
    pub user_id: String,
    #[serde(default)]
    pub user_type: Option<String>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at: Utc::now(),
            user_id: user_id.into(),
            user_type: None,
        }
    }

    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("user_id", &self.user_id)
            .field("user_type", &self.user_type)
            .finish()
    }
}

/// Shared handle to the persisted credential.
///
/// Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct AuthSessionStore {
    store: Arc<dyn KeyValueStore>,
    cached: Arc<RwLock<Option<Credential>>>,
}

impl AuthSessionStore {
    /// Open the session, restoring any credential persisted by a previous run.
    pub fn load(store: Arc<dyn KeyValueStore>) -> FleetResult<Self> {
        let cached = match store.get(SESSION_KEY)? {
            Some(raw) => match serde_json::from_str::<Credential>(&raw) {
                Ok(credential) => {
                    info!("restored session for user {}", credential.user_id);
                    Some(credential)
                }
                Err(e) => {
                    warn!("discarding unreadable stored credential: {e}");
                    store.remove(SESSION_KEY)?;
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            store,
            cached: Arc::new(RwLock::new(cached)),
        })
    }

    /// Current credential, if any.
    pub fn get(&self) -> Option<Credential> {
        self.cached.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|c| c.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get()
            .map(|c| c.refresh_token)
            .filter(|t| !t.is_empty())
    }

    /// Replace the stored credential. Persisted before it becomes visible.
    pub fn set(&self, credential: Credential) -> FleetResult<()> {
        self.persist(&credential)?;
        debug!("credential stored for user {}", credential.user_id);
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        Ok(())
    }

    /// Rotate the access token, keeping the refresh token unless a new one is given.
    pub fn set_access_token(&self, token: &str, refresh_token: Option<&str>) -> FleetResult<()> {
        let mut guard = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        let current = guard.as_ref().ok_or(FleetError::NotAuthenticated)?;

        let mut rotated = current.clone();
        rotated.access_token = token.to_string();
        if let Some(refresh) = refresh_token {
            rotated.refresh_token = refresh.to_string();
        }
        rotated.issued_at = Utc::now();

        self.persist(&rotated)?;
        *guard = Some(rotated);
        debug!("access token rotated");
        Ok(())
    }

    /// Forget the credential in memory and on disk.
    pub fn clear(&self) -> FleetResult<()> {
        let mut guard = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        self.store.remove(SESSION_KEY)?;
        if guard.take().is_some() {
            info!("session credentials cleared");
        }
        Ok(())
    }

    /// A credential with a non-empty access token is present.
    pub fn has_valid_credential(&self) -> bool {
        self.get()
            .map(|c| !c.access_token.is_empty() && !c.user_id.is_empty())
            .unwrap_or(false)
    }

    fn persist(&self, credential: &Credential) -> FleetResult<()> {
        let raw = serde_json::to_string(credential)?;
        self.store.set(SESSION_KEY, &raw)
    }
}

impl fmt::Debug for AuthSessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSessionStore")
            .field("authenticated", &self.has_valid_credential())
            .finish()
    }
}
