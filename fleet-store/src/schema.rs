//! Database schema definitions and table creation.

use rusqlite::Connection;
use tracing::info;

use fleet_core::error::{FleetError, FleetResult};

/// Create all tables and indexes if they do not exist.
pub fn create_tables(conn: &Connection) -> FleetResult<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(|e| FleetError::Database(format!("failed to create schema: {e}")))?;
    info!("database schema verified");
    Ok(())
}

/// Tables whose row counts are reported by `Database::stats`.
pub const DATA_TABLES: &[&str] = &["kv_store", "offline_actions", "rejected_actions"];

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

-- Small string values (the serialized session credential)
CREATE TABLE IF NOT EXISTS kv_store (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
);

-- Offline action queue. `seq` breaks ties between equal timestamps.
CREATE TABLE IF NOT EXISTS offline_actions (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    owner       TEXT
);

CREATE INDEX IF NOT EXISTS idx_offline_actions_order
    ON offline_actions (created_at, seq);

-- Actions the server refused on replay
CREATE TABLE IF NOT EXISTS rejected_actions (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    attempts     INTEGER NOT NULL,
    reason       TEXT NOT NULL,
    status       INTEGER NOT NULL,
    rejected_at  INTEGER NOT NULL,
    owner        TEXT
);

CREATE INDEX IF NOT EXISTS idx_rejected_actions_time
    ON rejected_actions (rejected_at);
"#;
