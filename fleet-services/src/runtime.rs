//! Client runtime: wires every connectivity component for one signed-in
//! client and owns their lifecycle.
//!
//! Components are built in dependency order by [`ClientRuntime::init`] and
//! torn down in reverse by [`ClientRuntime::shutdown`]. Nothing here is
//! global; callers hold the runtime and pass references down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleet_api::{HealthReport, HttpTransport, ReqwestTransport, RequestExecutor};
use fleet_core::config::{AppConfig, ServerConfig};
use fleet_core::error::{FleetError, FleetResult};
use fleet_core::session::{AuthSessionStore, Credential};
use fleet_core::storage::{ActionStore, KeyValueStore, MemoryStore};
use fleet_socket::{
    ConnectionManager, ConnectionSettings, ConnectionState, TungsteniteTransport, WsTransport,
};
use fleet_store::{Database, SqliteStore};

use crate::connectivity::{ConnectivityMonitor, StatusIndicator};
use crate::event_bus::{AppEvent, EventBus};
use crate::notification::{CriticalAlertNotifier, DesktopNotifier, Notifier};
use crate::offline_queue::{ActionRouter, OfflineActionQueue};
use crate::service::{ComponentHealth, Service, ServiceState};

/// Durable backing for credentials and the action queue.
#[derive(Clone)]
pub struct Storage {
    pub kv: Arc<dyn KeyValueStore>,
    pub actions: Arc<dyn ActionStore>,
}

impl Storage {
    /// Nothing survives the process.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            kv: store.clone(),
            actions: store,
        }
    }

    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            kv: store.clone(),
            actions: store,
        }
    }

    /// Open (or create) the SQLite database named by the config.
    pub fn open(config: &AppConfig) -> FleetResult<Self> {
        let path = config.effective_db_path()?;
        let db = Database::init(&path, &config.database)?;
        Ok(Self::sqlite(SqliteStore::new(db)))
    }
}

/// Network transports. Production uses reqwest and tokio-tungstenite.
#[derive(Clone)]
pub struct Transports {
    pub http: Arc<dyn HttpTransport>,
    pub ws: Arc<dyn WsTransport>,
}

impl Transports {
    pub fn from_config(server: &ServerConfig) -> FleetResult<Self> {
        Ok(Self {
            http: Arc::new(ReqwestTransport::new(server)?),
            ws: Arc::new(TungsteniteTransport::new(server.connect_timeout())),
        })
    }
}

pub struct ClientRuntime {
    config: AppConfig,
    events: EventBus,
    session: AuthSessionStore,
    executor: RequestExecutor,
    connection: Arc<ConnectionManager>,
    queue: OfflineActionQueue,
    alerts: CriticalAlertNotifier,
    monitor: ConnectivityMonitor,
    session_watch: Mutex<Option<JoinHandle<()>>>,
    session_expired: Arc<AtomicBool>,
    stopped: AtomicBool,
}

impl ClientRuntime {
    /// Build every component. Must run inside a tokio runtime.
    pub async fn init(
        config: AppConfig,
        storage: Storage,
        transports: Transports,
        notifier: Arc<dyn Notifier>,
    ) -> FleetResult<Self> {
        if !config.is_server_configured() {
            return Err(FleetError::MissingConfig(
                "server.api_base_url and server.ws_url".into(),
            ));
        }
        info!("initializing client runtime");

        let events = EventBus::default();
        let session = AuthSessionStore::load(storage.kv)?;
        let executor = RequestExecutor::from_config(&config, transports.http, session.clone());

        let connection = Arc::new(ConnectionManager::new(
            ConnectionSettings::from_config(&config),
            session.clone(),
            transports.ws,
        ));
        for topic in &config.connection.topics {
            connection.acquire_topic(topic.clone());
        }

        let router = ActionRouter::with_overrides(&config.queue.routes)?;
        let queue = OfflineActionQueue::new(
            storage.actions,
            executor.clone(),
            router,
            events.clone(),
            config.queue.max_replay_attempts,
        );

        let alerts = CriticalAlertNotifier::new(notifier, events.clone(), config.notifications.clone());
        alerts.attach(connection.dispatcher());

        let monitor = ConnectivityMonitor::new(queue.clone(), events.clone(), config.queue.drain_on_connect);
        monitor.start(connection.state(), connection.state_changes());

        let session_expired = Arc::new(AtomicBool::new(false));
        let session_watch = spawn_session_watch(
            &executor,
            connection.clone(),
            events.clone(),
            session_expired.clone(),
        );

        info!(
            "client runtime ready (signed in: {})",
            session.has_valid_credential()
        );
        Ok(Self {
            config,
            events,
            session,
            executor,
            connection,
            queue,
            alerts,
            monitor,
            session_watch: Mutex::new(Some(session_watch)),
            session_expired,
            stopped: AtomicBool::new(false),
        })
    }

    /// SQLite storage, real transports, desktop notifications.
    pub async fn init_default(config: AppConfig) -> FleetResult<Self> {
        let storage = Storage::open(&config)?;
        let transports = Transports::from_config(&config.server)?;
        Self::init(config, storage, transports, Arc::new(DesktopNotifier)).await
    }

    /// Store a credential and bring the socket up.
    pub async fn login(&self, credential: Credential) -> FleetResult<ConnectionState> {
        info!("signing in as {}", credential.user_id);
        self.session.set(credential)?;
        self.session_expired.store(false, Ordering::SeqCst);
        Ok(self.connection.connect().await)
    }

    /// Disconnect and forget the credential. Queued actions are kept and
    /// replay after the next sign-in.
    pub async fn logout(&self) -> FleetResult<()> {
        self.connection.disconnect().await;
        self.session.clear()?;
        self.events.emit(AppEvent::SessionEnded {
            reason: "logged out".into(),
        });
        info!("signed out");
        Ok(())
    }

    pub async fn connect(&self) -> ConnectionState {
        self.connection.connect().await
    }

    /// Tear down in reverse order of construction. Safe to call twice.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down client runtime");
        self.abort_session_watch();
        self.monitor.stop();
        self.alerts.detach();
        self.connection.disconnect().await;
        debug!("client runtime stopped");
    }

    fn abort_session_watch(&self) {
        if let Some(task) = self
            .session_watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    pub fn indicator(&self) -> StatusIndicator {
        StatusIndicator::from_parts(
            self.connection.state(),
            self.queue.size().unwrap_or(0),
            self.session_expired.load(Ordering::SeqCst),
        )
    }

    /// Local component health.
    pub fn health(&self) -> Vec<ComponentHealth> {
        let session = ComponentHealth {
            name: "session",
            state: if self.session.has_valid_credential() {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            },
            detail: match self.session.get() {
                Some(c) => format!("signed in as {}", c.user_id),
                None if self.session_expired.load(Ordering::SeqCst) => "expired".into(),
                None => "signed out".into(),
            },
        };

        let socket_state = self.connection.state();
        let socket = ComponentHealth {
            name: "socket",
            state: match socket_state {
                ConnectionState::Connected => ServiceState::Running,
                ConnectionState::Connecting | ConnectionState::Reconnecting => ServiceState::Degraded,
                ConnectionState::Failed => ServiceState::Failed,
                ConnectionState::Disconnected => ServiceState::Stopped,
            },
            detail: format!(
                "{socket_state}, {} reconnect attempt(s)",
                self.connection.reconnect_attempts()
            ),
        };

        vec![
            session,
            socket,
            ComponentHealth::of(&self.queue),
            ComponentHealth::of(&self.alerts),
            ComponentHealth::of(&self.monitor),
        ]
    }

    /// Server-side health report.
    pub async fn api_health(&self) -> FleetResult<HealthReport> {
        Ok(self.executor.health().await?)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &AuthSessionStore {
        &self.session
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn queue(&self) -> &OfflineActionQueue {
        &self.queue
    }
}

impl Drop for ClientRuntime {
    fn drop(&mut self) {
        self.abort_session_watch();
    }
}

/// On refresh failure: stop the socket, mark the session expired, tell the app.
fn spawn_session_watch(
    executor: &RequestExecutor,
    connection: Arc<ConnectionManager>,
    events: EventBus,
    expired: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut rx = executor.refresher().session_events();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ended) => {
                    warn!("session ended: {}", ended.reason);
                    expired.store(true, Ordering::SeqCst);
                    connection.disconnect().await;
                    events.emit(AppEvent::SessionEnded {
                        reason: ended.reason,
                    });
                }
                Err(RecvError::Lagged(skipped)) => debug!("session watch lagged by {skipped}"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
