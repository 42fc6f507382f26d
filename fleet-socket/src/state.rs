//! Connection state published by the connection manager.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to connect.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Authenticated and subscribed; frames are flowing.
    Connected,
    /// Connection lost, waiting out the backoff before the next attempt.
    Reconnecting,
    /// Reconnect attempts exhausted. Only a forced reconnect leaves this state.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
