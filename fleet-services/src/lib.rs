//! FleetOps Services - Components built on top of the API and socket layers.
//!
//! This crate provides:
//! - The offline action queue (durable FIFO, ordered replay, rejected list)
//! - The connectivity monitor (queue drain on connect, UI status indicator)
//! - Critical alert notifications
//! - The application event bus
//! - `ClientRuntime`, which wires everything for one client and owns the
//!   init/shutdown lifecycle

pub mod connectivity;
pub mod event_bus;
pub mod notification;
pub mod offline_queue;
pub mod runtime;
pub mod service;

pub use connectivity::{ConnectivityMonitor, StatusIndicator};
pub use event_bus::{AppEvent, EventBus};
pub use notification::{CriticalAlertNotifier, DesktopNotifier, Notifier};
pub use offline_queue::{
    ActionEntry, ActionRouter, ActionState, DrainReport, OfflineActionQueue, Route, SubmitError,
    SubmitOutcome,
};
pub use runtime::{ClientRuntime, Storage, Transports};
pub use service::{ComponentHealth, Service, ServiceState};
