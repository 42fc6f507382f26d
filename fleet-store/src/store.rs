//! SQLite implementation of the storage seam.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;
use uuid::Uuid;

use fleet_core::error::{FleetError, FleetResult};
use fleet_core::storage::{ActionStore, KeyValueStore, QueuedAction, RejectedAction};

use crate::db::Database;

/// Durable key/value and action storage backed by [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

fn db_err(e: rusqlite::Error) -> FleetError {
    FleetError::Database(e.to_string())
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn from_micros(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

/// Columns: id, kind, payload, created_at, attempts, owner.
fn action_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedAction> {
    let id: String = row.get(0)?;
    let payload: String = row.get(2)?;
    Ok(QueuedAction {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        kind: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(2, e))?,
        created_at: from_micros(3, row.get(3)?)?,
        attempts: row.get(4)?,
        owner: row.get(5)?,
    })
}

/// Columns: action columns, then reason, status, rejected_at.
fn rejected_from_row(row: &Row<'_>) -> rusqlite::Result<RejectedAction> {
    Ok(RejectedAction {
        action: action_from_row(row)?,
        reason: row.get(6)?,
        status: row.get(7)?,
        rejected_at: from_micros(8, row.get(8)?)?,
    })
}

const PENDING_SQL: &str = "SELECT id, kind, payload, created_at, attempts, owner
     FROM offline_actions ORDER BY created_at ASC, seq ASC";

const REJECTED_SQL: &str = "SELECT id, kind, payload, created_at, attempts, owner,
            reason, status, rejected_at
     FROM rejected_actions";

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> FleetResult<Option<String>> {
        let conn = self.db.conn()?;
        conn.query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .map_err(db_err)
    }

    fn set(&self, key: &str, value: &str) -> FleetResult<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, to_micros(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> FleetResult<()> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])
            .map_err(db_err)?;
        Ok(())
    }
}

impl ActionStore for SqliteStore {
    fn append(&self, action: &QueuedAction) -> FleetResult<()> {
        let payload = serde_json::to_string(&action.payload)?;
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO offline_actions (id, kind, payload, created_at, attempts, owner)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                action.id.to_string(),
                action.kind,
                payload,
                to_micros(action.created_at),
                action.attempts,
                action.owner
            ],
        )
        .map_err(db_err)?;
        debug!("persisted action {} ({})", action.id, action.kind);
        Ok(())
    }

    fn pending(&self) -> FleetResult<Vec<QueuedAction>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(PENDING_SQL).map_err(db_err)?;
        let rows = stmt
            .query_map([], action_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn front(&self) -> FleetResult<Option<QueuedAction>> {
        let conn = self.db.conn()?;
        conn.query_row(&format!("{PENDING_SQL} LIMIT 1"), [], action_from_row)
            .optional()
            .map_err(db_err)
    }

    fn record_attempt(&self, id: Uuid) -> FleetResult<Option<u32>> {
        self.db.transaction(|conn| {
            let updated = conn
                .execute(
                    "UPDATE offline_actions SET attempts = attempts + 1 WHERE id = ?1",
                    [id.to_string()],
                )
                .map_err(db_err)?;
            if updated == 0 {
                return Ok(None);
            }
            conn.query_row(
                "SELECT attempts FROM offline_actions WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .map(Some)
            .map_err(db_err)
        })
    }

    fn remove_action(&self, id: Uuid) -> FleetResult<bool> {
        let conn = self.db.conn()?;
        let removed = conn
            .execute("DELETE FROM offline_actions WHERE id = ?1", [id.to_string()])
            .map_err(db_err)?;
        Ok(removed > 0)
    }

    fn count(&self) -> FleetResult<usize> {
        let conn = self.db.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }

    fn clear(&self) -> FleetResult<usize> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM offline_actions", []).map_err(db_err)
    }

    fn reject(&self, rejected: &RejectedAction) -> FleetResult<()> {
        let action = &rejected.action;
        let payload = serde_json::to_string(&action.payload)?;
        self.db.transaction(|conn| {
            conn.execute(
                "DELETE FROM offline_actions WHERE id = ?1",
                [action.id.to_string()],
            )
            .map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO rejected_actions
                 (id, kind, payload, created_at, attempts, reason, status, rejected_at, owner)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    action.id.to_string(),
                    action.kind,
                    payload,
                    to_micros(action.created_at),
                    action.attempts,
                    rejected.reason,
                    rejected.status,
                    to_micros(rejected.rejected_at),
                    action.owner
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn rejected(&self) -> FleetResult<Vec<RejectedAction>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!("{REJECTED_SQL} ORDER BY rejected_at ASC"))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], rejected_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    fn remove_rejected(&self, id: Uuid) -> FleetResult<Option<RejectedAction>> {
        self.db.transaction(|conn| {
            let found = conn
                .query_row(
                    &format!("{REJECTED_SQL} WHERE id = ?1"),
                    [id.to_string()],
                    rejected_from_row,
                )
                .optional()
                .map_err(db_err)?;
            if found.is_some() {
                conn.execute("DELETE FROM rejected_actions WHERE id = ?1", [id.to_string()])
                    .map_err(db_err)?;
            }
            Ok(found)
        })
    }
}
