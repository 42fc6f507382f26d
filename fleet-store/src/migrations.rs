//! Versioned database migrations.
//!
//! `schema::create_tables` always creates the latest layout, so a fresh
//! database runs every step as a no-op. Each step commits together with its
//! version bump; an interrupted upgrade resumes at the failed step.

use rusqlite::Connection;
use tracing::info;

use fleet_core::constants::DB_SCHEMA_VERSION;
use fleet_core::error::{FleetError, FleetResult};

/// One schema change. Every step must be safe to run on a database that
/// already has the latest layout.
enum Step {
    Sql(&'static str),
    /// `ALTER TABLE .. ADD COLUMN`, skipped when the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

/// Attribute rows queued before v3 to the stored session, if there is one.
const BACKFILL_OWNER: &str = "
    UPDATE offline_actions SET owner = (
        SELECT json_extract(value, '$.user_id') FROM kv_store
        WHERE key = 'session.credential' AND json_valid(value)
    ) WHERE owner IS NULL;
    UPDATE rejected_actions SET owner = (
        SELECT json_extract(value, '$.user_id') FROM kv_store
        WHERE key = 'session.credential' AND json_valid(value)
    ) WHERE owner IS NULL;";

/// `(version, steps)` in ascending order.
const MIGRATIONS: &[(i32, &[Step])] = &[
    // v1: initial schema.
    (1, &[]),
    // v2: rejected actions are listed oldest first.
    (
        2,
        &[Step::Sql(
            "CREATE INDEX IF NOT EXISTS idx_rejected_actions_time
                 ON rejected_actions (rejected_at);",
        )],
    ),
    // v3: queued actions remember which user created them.
    (
        3,
        &[
            Step::AddColumn {
                table: "offline_actions",
                column: "owner",
                definition: "TEXT",
            },
            Step::AddColumn {
                table: "rejected_actions",
                column: "owner",
                definition: "TEXT",
            },
            Step::Sql(BACKFILL_OWNER),
        ],
    ),
];

/// Run all pending migrations on the database.
pub fn run_migrations(conn: &mut Connection) -> FleetResult<()> {
    let current = get_schema_version(conn)?;
    if current >= DB_SCHEMA_VERSION {
        info!("database schema is up to date (version {current})");
        return Ok(());
    }

    info!("migrating database from version {current} to {DB_SCHEMA_VERSION}");
    for (version, steps) in MIGRATIONS.iter().filter(|(v, _)| *v > current && *v <= DB_SCHEMA_VERSION) {
        let tx = conn
            .transaction()
            .map_err(|e| FleetError::Migration(e.to_string()))?;
        for step in steps.iter() {
            apply(&tx, step)
                .map_err(|e| FleetError::Migration(format!("version {version}: {e}")))?;
        }
        tx.execute("UPDATE schema_version SET version = ?1", [version])
            .map_err(|e| FleetError::Migration(e.to_string()))?;
        tx.commit().map_err(|e| FleetError::Migration(e.to_string()))?;
        info!("applied migration {version}");
    }
    Ok(())
}

fn apply(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    match step {
        Step::Sql(sql) => conn.execute_batch(sql),
        Step::AddColumn {
            table,
            column,
            definition,
        } => {
            if column_exists(conn, table, column)? {
                return Ok(());
            }
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition};"))
        }
    }
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}

/// Current schema version, initializing the row on first run.
pub fn get_schema_version(conn: &Connection) -> FleetResult<i32> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
        .map_err(|e| FleetError::Migration(e.to_string()))?;

    if count == 0 {
        conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])
            .map_err(|e| FleetError::Migration(e.to_string()))?;
        return Ok(0);
    }

    conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map_err(|e| FleetError::Migration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    fn index_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='index'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_on_fresh_db() {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::create_tables(&conn).unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), DB_SCHEMA_VERSION);
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), DB_SCHEMA_VERSION);
    }

    #[test]
    fn test_upgrade_from_v1_adds_index() {
        let mut conn = Connection::open_in_memory().unwrap();
        schema::create_tables(&conn).unwrap();
        conn.execute("DROP INDEX IF EXISTS idx_rejected_actions_time", [])
            .unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])
            .unwrap();

        run_migrations(&mut conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), DB_SCHEMA_VERSION);
        assert!(index_names(&conn).contains(&"idx_rejected_actions_time".to_string()));
    }

    #[test]
    fn test_upgrade_from_v2_attributes_queued_actions() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version) VALUES (2);
             CREATE TABLE kv_store (key TEXT PRIMARY KEY, value TEXT NOT NULL, updated_at INTEGER NOT NULL);
             CREATE TABLE offline_actions (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT, id TEXT NOT NULL UNIQUE, kind TEXT NOT NULL,
                 payload TEXT NOT NULL, created_at INTEGER NOT NULL, attempts INTEGER NOT NULL DEFAULT 0);
             CREATE TABLE rejected_actions (
                 id TEXT PRIMARY KEY, kind TEXT NOT NULL, payload TEXT NOT NULL, created_at INTEGER NOT NULL,
                 attempts INTEGER NOT NULL, reason TEXT NOT NULL, status INTEGER NOT NULL,
                 rejected_at INTEGER NOT NULL);
             INSERT INTO kv_store VALUES ('session.credential', '{\"user_id\":\"driver-9\"}', 0);
             INSERT INTO offline_actions (id, kind, payload, created_at) VALUES ('a1', 'end_trip', '{}', 1);",
        )
        .unwrap();
        schema::create_tables(&conn).unwrap();

        run_migrations(&mut conn).unwrap();
        // A second run is a no-op.
        run_migrations(&mut conn).unwrap();

        let owner: Option<String> = conn
            .query_row("SELECT owner FROM offline_actions WHERE id = 'a1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(owner.as_deref(), Some("driver-9"));
        assert!(column_exists(&conn, "rejected_actions", "owner").unwrap());
        assert_eq!(get_schema_version(&conn).unwrap(), DB_SCHEMA_VERSION);
    }

    #[test]
    fn test_backfill_reads_the_session_key() {
        assert!(BACKFILL_OWNER.contains(fleet_core::constants::SESSION_KEY));
    }

    #[test]
    fn test_migrations_are_ascending() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(MIGRATIONS.last().map(|m| m.0), Some(DB_SCHEMA_VERSION));
    }
}
