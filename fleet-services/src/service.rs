//! Component health reporting.
//!
//! Long-lived runtime components implement [`Service`] so the runtime can
//! report one health line per component.

use serde::Serialize;

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Created but not started.
    Created,
    /// Running and ready.
    Running,
    /// Running with reduced function (e.g. socket reconnecting).
    Degraded,
    /// Stopped by shutdown.
    Stopped,
    /// Encountered a fatal error.
    Failed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Degraded => write!(f, "degraded"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> ServiceState;

    /// One-line detail for diagnostics.
    fn detail(&self) -> String {
        String::new()
    }

    fn is_healthy(&self) -> bool {
        self.state() == ServiceState::Running
    }
}

/// Snapshot of one component for `health()` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub state: ServiceState,
    pub detail: String,
}

impl ComponentHealth {
    pub fn of(service: &dyn Service) -> Self {
        Self {
            name: service.name(),
            state: service.state(),
            detail: service.detail(),
        }
    }
}
