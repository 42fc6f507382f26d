//! Follows the socket state: forwards every transition to the event bus and
//! replays the offline queue every time the connection comes up.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleet_socket::ConnectionState;

use crate::event_bus::{AppEvent, EventBus};
use crate::offline_queue::OfflineActionQueue;
use crate::service::{Service, ServiceState};

/// What a UI should show for connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusIndicator {
    Online,
    Reconnecting,
    /// Offline with work that will be sent once back online.
    OfflineWillSync { pending: usize },
    Offline,
    /// Sign-in required.
    SessionExpired,
}

impl StatusIndicator {
    pub fn from_parts(state: ConnectionState, pending: usize, session_expired: bool) -> Self {
        if session_expired {
            return Self::SessionExpired;
        }
        match state {
            ConnectionState::Connected => Self::Online,
            ConnectionState::Connecting | ConnectionState::Reconnecting => Self::Reconnecting,
            ConnectionState::Disconnected | ConnectionState::Failed if pending > 0 => {
                Self::OfflineWillSync { pending }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => Self::Offline,
        }
    }
}

impl std::fmt::Display for StatusIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::OfflineWillSync { pending } => write!(f, "offline ({pending} pending, will sync)"),
            Self::Offline => write!(f, "offline"),
            Self::SessionExpired => write!(f, "session expired"),
        }
    }
}

pub struct ConnectivityMonitor {
    queue: OfflineActionQueue,
    events: EventBus,
    drain_on_connect: bool,
    task: Mutex<Option<JoinHandle<()>>>,
    last_state: Arc<Mutex<ConnectionState>>,
}

impl ConnectivityMonitor {
    pub fn new(queue: OfflineActionQueue, events: EventBus, drain_on_connect: bool) -> Self {
        Self {
            queue,
            events,
            drain_on_connect,
            task: Mutex::new(None),
            last_state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    /// Start following `changes`, beginning from `current`. Replaces any
    /// previous watch. Subscribe before reading `current` so nothing is lost
    /// in between; a repeated state is ignored.
    pub fn start(&self, current: ConnectionState, mut changes: broadcast::Receiver<ConnectionState>) {
        self.stop();

        let queue = self.queue.clone();
        let events = self.events.clone();
        let drain_on_connect = self.drain_on_connect;
        let last_state = self.last_state.clone();

        let task = tokio::spawn(async move {
            let mut state = current;
            let mut previous = None;
            loop {
                if previous != Some(state) {
                    previous = Some(state);
                    *last_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
                    events.emit(AppEvent::ConnectionStateChanged { state });
                    if state == ConnectionState::Connected && drain_on_connect {
                        spawn_drain(&queue);
                    }
                }

                state = match changes.recv().await {
                    Ok(state) => state,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("connectivity monitor skipped {skipped} state change(s)");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("connection state channel closed");
                        break;
                    }
                };
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Last state observed.
    pub fn last_state(&self) -> ConnectionState {
        *self.last_state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_drain(queue: &OfflineActionQueue) {
    let queue = queue.clone();
    tokio::spawn(async move {
        match queue.drain().await {
            Ok(report) if report.coalesced => debug!("drain on connect coalesced"),
            Ok(_) => {}
            Err(e) => warn!("drain on connect failed: {e}"),
        }
    });
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Service for ConnectivityMonitor {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    fn state(&self) -> ServiceState {
        if !self.is_running() {
            return ServiceState::Stopped;
        }
        match self.last_state() {
            ConnectionState::Connected => ServiceState::Running,
            ConnectionState::Failed => ServiceState::Failed,
            _ => ServiceState::Degraded,
        }
    }

    fn detail(&self) -> String {
        format!("socket {}", self.last_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline_queue::ActionRouter;
    use fleet_api::testing::MockHttpTransport;
    use fleet_api::RequestExecutor;
    use fleet_core::config::AppConfig;
    use fleet_core::session::AuthSessionStore;
    use fleet_core::storage::MemoryStore;
    use std::time::Duration;

    fn queue(events: &EventBus) -> OfflineActionQueue {
        let store = Arc::new(MemoryStore::new());
        let session = AuthSessionStore::load(store.clone()).unwrap();
        let executor = RequestExecutor::from_config(
            &AppConfig::default(),
            Arc::new(MockHttpTransport::new()),
            session,
        );
        OfflineActionQueue::new(store, executor, ActionRouter::default(), events.clone(), 0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_transition_reaches_the_bus() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let monitor = ConnectivityMonitor::new(queue(&events), events.clone(), false);
        let (tx, changes) = broadcast::channel(16);
        monitor.start(ConnectionState::Disconnected, changes);

        // Sent back to back, before the monitor gets to run.
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
        ] {
            tx.send(state).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        let mut seen = Vec::new();
        while let Ok(AppEvent::ConnectionStateChanged { state }) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting
            ]
        );
        assert_eq!(monitor.last_state(), ConnectionState::Reconnecting);
        monitor.stop();
    }

    #[test]
    fn test_indicator() {
        use ConnectionState::*;
        assert_eq!(StatusIndicator::from_parts(Connected, 3, false), StatusIndicator::Online);
        assert_eq!(StatusIndicator::from_parts(Reconnecting, 0, false), StatusIndicator::Reconnecting);
        assert_eq!(StatusIndicator::from_parts(Connecting, 0, false), StatusIndicator::Reconnecting);
        assert_eq!(
            StatusIndicator::from_parts(Failed, 2, false),
            StatusIndicator::OfflineWillSync { pending: 2 }
        );
        assert_eq!(StatusIndicator::from_parts(Disconnected, 0, false), StatusIndicator::Offline);
        assert_eq!(StatusIndicator::from_parts(Connected, 0, true), StatusIndicator::SessionExpired);
    }

    #[test]
    fn test_indicator_display() {
        assert_eq!(
            StatusIndicator::OfflineWillSync { pending: 4 }.to_string(),
            "offline (4 pending, will sync)"
        );
    }
}
