//! Durable storage seam.
//!
//! Credentials and the offline action queue must survive a process restart.
//! Both are written through the traits below; `fleet-store` provides the
//! SQLite implementation and [`MemoryStore`] serves tests and throwaway
//! sessions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FleetResult;

/// String key/value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> FleetResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> FleetResult<()>;
    fn remove(&self, key: &str) -> FleetResult<()>;
}

/// A user action waiting to be replayed against the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Stable identity, sent as the idempotency key on every replay.
    pub id: Uuid,
    /// Action kind, e.g. "start_trip" or "complete_delivery".
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Send attempts started so far, the initial direct send included.
    pub attempts: u32,
    /// User id of the signed-in user who created the action. Only that
    /// user's session replays it; `None` replays under any session.
    #[serde(default)]
    pub owner: Option<String>,
}

impl QueuedAction {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            owner: None,
        }
    }

    pub fn owned_by(mut self, user_id: impl Into<String>) -> Self {
        self.owner = Some(user_id.into());
        self
    }

    /// Whether a session for `user_id` may replay this action.
    pub fn replayable_by(&self, user_id: &str) -> bool {
        self.owner.as_deref().map_or(true, |owner| owner == user_id)
    }
}

/// An action the server refused on replay, kept for manual resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedAction {
    pub action: QueuedAction,
    pub reason: String,
    /// HTTP status of the rejection, 0 when no request was made.
    pub status: u16,
    pub rejected_at: DateTime<Utc>,
}

/// Durable FIFO of queued actions plus the rejected list.
///
/// `pending` and `front` order by `created_at`, ties broken by insertion order.
pub trait ActionStore: Send + Sync {
    fn append(&self, action: &QueuedAction) -> FleetResult<()>;
    fn pending(&self) -> FleetResult<Vec<QueuedAction>>;
    fn front(&self) -> FleetResult<Option<QueuedAction>>;
    /// Increment and persist the attempt count, returning the new value.
    /// Returns `None` if the action is no longer queued.
    fn record_attempt(&self, id: Uuid) -> FleetResult<Option<u32>>;
    /// Returns `true` if the action was queued.
    fn remove_action(&self, id: Uuid) -> FleetResult<bool>;
    fn count(&self) -> FleetResult<usize>;
    /// Remove every pending action, returning how many were dropped.
    fn clear(&self) -> FleetResult<usize>;
    /// Move an action from the queue to the rejected list in one step.
    fn reject(&self, rejected: &RejectedAction) -> FleetResult<()>;
    fn rejected(&self) -> FleetResult<Vec<RejectedAction>>;
    fn remove_rejected(&self, id: Uuid) -> FleetResult<Option<RejectedAction>>;
}

#[derive(Default)]
struct MemoryInner {
    kv: HashMap<String, String>,
    actions: Vec<QueuedAction>,
    rejected: Vec<RejectedAction>,
}

/// In-process implementation of both storage traits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ordered(actions: &[QueuedAction]) -> Vec<QueuedAction> {
    let mut sorted = actions.to_vec();
    // Stable sort keeps insertion order for equal timestamps.
    sorted.sort_by_key(|a| a.created_at);
    sorted
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> FleetResult<Option<String>> {
        Ok(self.lock().kv.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> FleetResult<()> {
        self.lock().kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> FleetResult<()> {
        self.lock().kv.remove(key);
        Ok(())
    }
}

impl ActionStore for MemoryStore {
    fn append(&self, action: &QueuedAction) -> FleetResult<()> {
        self.lock().actions.push(action.clone());
        Ok(())
    }

    fn pending(&self) -> FleetResult<Vec<QueuedAction>> {
        Ok(ordered(&self.lock().actions))
    }

    fn front(&self) -> FleetResult<Option<QueuedAction>> {
        Ok(ordered(&self.lock().actions).into_iter().next())
    }

    fn record_attempt(&self, id: Uuid) -> FleetResult<Option<u32>> {
        let mut inner = self.lock();
        Ok(inner.actions.iter_mut().find(|a| a.id == id).map(|a| {
            a.attempts += 1;
            a.attempts
        }))
    }

    fn remove_action(&self, id: Uuid) -> FleetResult<bool> {
        let mut inner = self.lock();
        let before = inner.actions.len();
        inner.actions.retain(|a| a.id != id);
        Ok(inner.actions.len() != before)
    }

    fn count(&self) -> FleetResult<usize> {
        Ok(self.lock().actions.len())
    }

    fn clear(&self) -> FleetResult<usize> {
        let mut inner = self.lock();
        let dropped = inner.actions.len();
        inner.actions.clear();
        Ok(dropped)
    }

    fn reject(&self, rejected: &RejectedAction) -> FleetResult<()> {
        let mut inner = self.lock();
        inner.actions.retain(|a| a.id != rejected.action.id);
        inner.rejected.push(rejected.clone());
        Ok(())
    }

    fn rejected(&self) -> FleetResult<Vec<RejectedAction>> {
        Ok(self.lock().rejected.clone())
    }

    fn remove_rejected(&self, id: Uuid) -> FleetResult<Option<RejectedAction>> {
        let mut inner = self.lock();
        let pos = inner.rejected.iter().position(|r| r.action.id == id);
        Ok(pos.map(|i| inner.rejected.remove(i)))
    }
}
