//! Shared helpers for runtime integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use fleet_api::testing::MockHttpTransport;
use fleet_core::config::AppConfig;
use fleet_core::config::DatabaseConfig;
use fleet_core::error::FleetResult;
use fleet_core::session::Credential;
use fleet_services::event_bus::AppEvent;
use fleet_services::notification::Notifier;
use fleet_services::runtime::{ClientRuntime, Storage, Transports};
use fleet_socket::testing::MockWsTransport;
use fleet_socket::ConnectionState;
use fleet_store::{Database, SqliteStore};
use tokio::sync::broadcast;

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.api_base_url = "https://api.fleet.test".into();
    config.server.ws_url = "wss://api.fleet.test/ws".into();
    config.connection.topics = vec!["vehicles".into(), "alerts".into()];
    config
}

pub fn credential() -> Credential {
    Credential::new("access-1", "refresh-1", "driver-42").with_user_type("driver")
}

/// SQLite storage at `dir/fleet.db`. Reopening the same dir simulates a restart.
pub fn sqlite_storage(dir: &Path) -> Storage {
    let config = DatabaseConfig {
        integrity_check_on_startup: false,
        ..DatabaseConfig::default()
    };
    let db = Database::init(&dir.join("fleet.db"), &config).expect("failed to open test database");
    Storage::sqlite(SqliteStore::new(db))
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub shown: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, _body: &str, _sound: bool) -> FleetResult<()> {
        self.shown.lock().unwrap().push(title.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub runtime: ClientRuntime,
    pub http: Arc<MockHttpTransport>,
    pub ws: MockWsTransport,
    pub notifier: Arc<RecordingNotifier>,
}

pub async fn harness(storage: Storage) -> Harness {
    harness_with(test_config(), storage).await
}

pub async fn harness_with(config: AppConfig, storage: Storage) -> Harness {
    let http = Arc::new(MockHttpTransport::new());
    let ws = MockWsTransport::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let transports = Transports {
        http: http.clone(),
        ws: Arc::new(ws.clone()),
    };
    let runtime = ClientRuntime::init(config, storage, transports, notifier.clone())
        .await
        .expect("runtime init failed");
    Harness {
        runtime,
        http,
        ws,
        notifier,
    }
}

pub async fn wait_for_state(runtime: &ClientRuntime, state: ConnectionState) {
    let mut rx = runtime.connection().state_receiver();
    rx.wait_for(|s| *s == state).await.expect("state channel closed");
}

/// Receive events until one matches.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<AppEvent>, mut pred: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(event) if pred(&event) => return event,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(e) => panic!("event bus closed: {e}"),
        }
    }
}
