//! Typed event bus for application-level notifications.
//!
//! Uses a tokio broadcast channel so the UI (or CLI) can follow connection
//! changes, queue progress, and session loss without the emitting component
//! knowing who is listening.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use fleet_socket::{ConnectionState, FleetAlert};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AppEvent {
    ConnectionStateChanged {
        state: ConnectionState,
    },
    /// Refresh failed or the user logged out; a new sign-in is required.
    SessionEnded {
        reason: String,
    },
    ActionQueued {
        id: Uuid,
        kind: String,
    },
    ActionReplayed {
        id: Uuid,
        kind: String,
    },
    /// Replay ended in a terminal failure; the action moved to the rejected list.
    ActionRejected {
        id: Uuid,
        kind: String,
        reason: String,
        status: u16,
    },
    QueueDrained {
        replayed: usize,
        rejected: usize,
        remaining: usize,
    },
    CriticalAlert {
        alert: FleetAlert,
    },
}

impl AppEvent {
    pub fn label(&self) -> &'static str {
        match self {
            AppEvent::ConnectionStateChanged { .. } => "ConnectionStateChanged",
            AppEvent::SessionEnded { .. } => "SessionEnded",
            AppEvent::ActionQueued { .. } => "ActionQueued",
            AppEvent::ActionReplayed { .. } => "ActionReplayed",
            AppEvent::ActionRejected { .. } => "ActionRejected",
            AppEvent::QueueDrained { .. } => "QueueDrained",
            AppEvent::CriticalAlert { .. } => "CriticalAlert",
        }
    }
}

/// Fan-out delivery: every subscriber gets every event. Subscribers that fall
/// behind receive `Lagged` and skip ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<AppEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        let label = event.label();
        match self.sender.send(event) {
            Ok(count) => debug!("event_bus: emitted {label} to {count} subscriber(s)"),
            Err(_) => debug!("event_bus: no subscribers for {label}"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(AppEvent::ConnectionStateChanged {
            state: ConnectionState::Reconnecting,
        });

        match rx.recv().await.unwrap() {
            AppEvent::ConnectionStateChanged { state } => {
                assert_eq!(state, ConnectionState::Reconnecting)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(AppEvent::SessionEnded {
            reason: "logout".into(),
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = AppEvent::QueueDrained {
            replayed: 2,
            rejected: 1,
            remaining: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queue_drained");
        assert_eq!(json["replayed"], 2);
    }
}
