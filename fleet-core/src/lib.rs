//! FleetOps Core - Foundation types shared by every client crate.
//!
//! This crate provides:
//! - Application configuration (API/WebSocket endpoints, retry and reconnect tuning)
//! - The unified error type
//! - Structured logging with tracing
//! - Platform data/config directories
//! - Exponential backoff math shared by HTTP retries and socket reconnects
//! - The durable storage seam and the credential store built on top of it

pub mod backoff;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod platform;
pub mod session;
pub mod storage;

// Re-export commonly used items at the crate root
pub use config::{AppConfig, ConfigHandle};
pub use error::{FleetError, FleetResult};
pub use logging::{init_logging, redact_url};
pub use platform::Platform;
pub use session::{AuthSessionStore, Credential};
pub use storage::{ActionStore, KeyValueStore, MemoryStore, QueuedAction, RejectedAction};
