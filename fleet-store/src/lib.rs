//! FleetOps Store - SQLite persistence for credentials and the offline queue.
//!
//! Owns database initialization (WAL, pooling, integrity check), the schema
//! and its versioned migrations, and [`SqliteStore`], the durable
//! implementation of the `fleet-core` storage traits.

pub mod db;
pub mod migrations;
pub mod schema;
pub mod store;

pub use db::{Database, DatabaseStats, DbPool};
pub use store::SqliteStore;
