//! Database initialization, connection pooling, and lifecycle management.
//!
//! Uses SQLite in WAL mode with r2d2 connection pooling.
//! Runs integrity checks on startup and applies versioned migrations.

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::{error, info};

use fleet_core::config::DatabaseConfig;
use fleet_core::error::{FleetError, FleetResult};

use crate::migrations;
use crate::schema;

/// Type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database wrapper providing initialization, pooling, and lifecycle management.
#[derive(Clone)]
pub struct Database {
    pool: Arc<DbPool>,
}

impl Database {
    /// Open (creating if needed) the database at `db_path`.
    ///
    /// Applies connection pragmas, optionally runs an integrity check,
    /// then creates the schema and runs pending migrations.
    pub fn init(db_path: &Path, config: &DatabaseConfig) -> FleetResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("initializing database at {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path);
        Self::with_manager(manager, config, false)
    }

    /// In-memory database with a single pooled connection.
    pub fn open_in_memory() -> FleetResult<Self> {
        let config = DatabaseConfig {
            wal_mode: false,
            pool_size: 1,
            integrity_check_on_startup: false,
            ..DatabaseConfig::default()
        };
        Self::with_manager(SqliteConnectionManager::memory(), &config, true)
    }

    fn with_manager(
        manager: SqliteConnectionManager,
        config: &DatabaseConfig,
        in_memory: bool,
    ) -> FleetResult<Self> {
        let mut builder = Pool::builder().max_size(config.pool_size.max(1));
        if in_memory {
            // Each in-memory connection is its own database; never recycle it.
            builder = builder.idle_timeout(None).max_lifetime(None);
        }
        let pool = builder
            .connection_customizer(Box::new(ConnectionCustomizer {
                wal_mode: config.wal_mode,
            }))
            .build(manager)
            .map_err(|e| FleetError::Pool(e.to_string()))?;

        let db = Self {
            pool: Arc::new(pool),
        };

        if config.integrity_check_on_startup {
            db.run_integrity_check()?;
        }

        {
            let mut conn = db.conn()?;
            schema::create_tables(&conn)?;
            migrations::run_migrations(&mut conn)?;
        }

        info!("database initialized successfully");
        Ok(db)
    }

    /// Get a connection from the pool.
    pub fn conn(&self) -> FleetResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| FleetError::Pool(e.to_string()))
    }

    /// Run a SQLite integrity check.
    pub fn run_integrity_check(&self) -> FleetResult<()> {
        let conn = self.conn()?;
        let result: String = conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))
            .map_err(|e| FleetError::Database(e.to_string()))?;

        if result != "ok" {
            error!("database integrity check failed: {result}");
            return Err(FleetError::IntegrityCheck(result));
        }

        info!("database integrity check passed");
        Ok(())
    }

    /// Execute a function within a database transaction.
    pub fn transaction<T, F>(&self, f: F) -> FleetResult<T>
    where
        F: FnOnce(&Connection) -> FleetResult<T>,
    {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| FleetError::Database(e.to_string()))?;

        let result = f(&tx)?;

        tx.commit().map_err(|e| FleetError::Database(e.to_string()))?;

        Ok(result)
    }

    /// Row counts per data table.
    pub fn stats(&self) -> FleetResult<DatabaseStats> {
        let conn = self.conn()?;

        let count = |table: &str| -> FleetResult<i64> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            conn.query_row(&sql, [], |row| row.get(0))
                .map_err(|e| FleetError::Database(e.to_string()))
        };

        Ok(DatabaseStats {
            kv_entries: count("kv_store")?,
            pending_actions: count("offline_actions")?,
            rejected_actions: count("rejected_actions")?,
        })
    }
}

/// Database row count statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    pub kv_entries: i64,
    pub pending_actions: i64,
    pub rejected_actions: i64,
}

impl std::fmt::Display for DatabaseStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kv={}, pending={}, rejected={}",
            self.kv_entries, self.pending_actions, self.rejected_actions
        )
    }
}

/// r2d2 connection customizer that applies PRAGMA settings.
#[derive(Debug)]
struct ConnectionCustomizer {
    wal_mode: bool,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for ConnectionCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        if self.wal_mode {
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        }

        // FULL sync: a queued action must be on disk before the replay starts.
        conn.execute_batch(
            "PRAGMA synchronous=FULL;
             PRAGMA temp_store=MEMORY;
             PRAGMA busy_timeout=5000;",
        )?;

        Ok(())
    }
}
