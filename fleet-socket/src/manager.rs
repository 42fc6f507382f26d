//! WebSocket connection manager.
//!
//! Owns the single long-lived connection to the fleet event socket: builds the
//! authenticated URL, performs the authenticate/subscribe handshake, keeps the
//! link alive with heartbeats, and reconnects with capped exponential backoff.
//!
//! All timers live inside one background task driven by a command channel, so
//! `disconnect()` can cancel every pending timer by stopping that task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Url;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use fleet_core::backoff::{apply_jitter, reconnect_delay};
use fleet_core::config::AppConfig;
use fleet_core::constants::close_codes;
use fleet_core::error::{FleetError, FleetResult};
use fleet_core::session::AuthSessionStore;
use fleet_core::redact_url;

use crate::dispatcher::MessageDispatcher;
use crate::frames::{FrameKind, InboundFrame, OutboundFrame};
use crate::state::ConnectionState;
use crate::subscriptions::{Subscription, Subscriptions};
use crate::transport::{WsChannel, WsEvent, WsTransport};

const TRANSITION_CAPACITY: usize = 64;

/// Reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Cap for the doubled delay.
    pub max_delay: Duration,
    /// Attempts before giving up and entering `Failed`.
    pub max_attempts: u32,
    /// 0.0 disables jitter.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter_factor: 0.0,
        }
    }
}

/// Liveness checking while connected.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Idle time before the client sends a ping.
    pub interval: Duration,
    /// How long to wait for any traffic after a ping.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the connection task needs besides the credential.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Socket endpoint; `token`, `userId` and `userType` are appended as
    /// query parameters on every attempt.
    pub ws_url: String,
    /// Fallback `userType` when the credential does not carry one.
    pub user_type: Option<String>,
    /// Backoff schedule after abnormal closes.
    pub reconnect: ReconnectConfig,
    /// Ping interval and pong deadline while connected.
    pub heartbeat: HeartbeatConfig,
    /// How long `disconnect()` waits for the task before aborting it.
    pub shutdown_timeout: Duration,
}

impl ConnectionSettings {
    /// Default reconnect and heartbeat settings for `ws_url`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            user_type: None,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    /// Settings from the `server` and `connection` config sections.
    pub fn from_config(config: &AppConfig) -> Self {
        let conn = &config.connection;
        Self {
            ws_url: config.server.ws_url.clone(),
            user_type: config.server.user_type.clone(),
            reconnect: ReconnectConfig {
                base_delay: conn.base_delay(),
                max_delay: conn.max_delay(),
                max_attempts: conn.max_reconnect_attempts,
                jitter_factor: conn.jitter_factor,
            },
            heartbeat: HeartbeatConfig {
                interval: conn.heartbeat_interval(),
                pong_timeout: conn.pong_timeout(),
            },
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
/// Requests from the manager handle to its connection task.
enum Command {
    /// Write a serialized frame if the channel is open.
    Send(String),
    /// Re-send `subscribe` with the current topic set.
    Resubscribe,
    /// Drop any open channel and connect now with a fresh attempt count.
    Reconnect,
    /// Close with 1000 and stop the task.
    Disconnect,
}

/// The running connection task.
struct TaskHandle {
    /// Command channel into the task.
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Joined by `disconnect()` so no timer outlives it.
    join: JoinHandle<()>,
}

/// Shared between the manager handle and its connection task.
#[derive(Clone)]
struct Shared {
    /// Immutable connection settings.
    settings: Arc<ConnectionSettings>,
    /// Read on every attempt for the current token and user.
    session: AuthSessionStore,
    /// Opens channels; mocked in tests.
    transport: Arc<dyn WsTransport>,
    /// Receives every inbound frame except ping/pong.
    dispatcher: MessageDispatcher,
    /// Topics declared by the app, re-sent after each open.
    subscriptions: Arc<Mutex<Subscriptions>>,
    /// Latest connection state.
    state_tx: Arc<watch::Sender<ConnectionState>>,
    /// Every state change, in order.
    transitions: broadcast::Sender<ConnectionState>,
    /// Consecutive reconnect attempts since the last successful open.
    attempts: Arc<AtomicU32>,
}

impl Shared {
    fn set_state(&self, new_state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == new_state {
                return false;
            }
            info!("socket state: {} -> {}", *state, new_state);
            *state = new_state;
            true
        });
        if changed {
            // No subscribers is fine.
            let _ = self.transitions.send(new_state);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn topics(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .topics()
    }

    /// Socket URL with the current credential. Rebuilt on every attempt so a
    /// rotated token is picked up.
    fn socket_url(&self) -> FleetResult<Option<String>> {
        let Some(credential) = self.session.get() else {
            return Ok(None);
        };
        if credential.access_token.is_empty() {
            return Ok(None);
        }
        let mut url = Url::parse(&self.settings.ws_url)
            .map_err(|e| FleetError::Config(format!("invalid socket url: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", &credential.access_token);
            query.append_pair("userId", &credential.user_id);
            if let Some(user_type) = credential
                .user_type
                .as_deref()
                .or(self.settings.user_type.as_deref())
            {
                query.append_pair("userType", user_type);
            }
        }
        Ok(Some(url.to_string()))
    }
}

/// Manages the fleet event socket.
///
/// One instance per client runtime. The handle is cheap to call from any
/// task; the connection itself runs in a background task started by
/// [`connect`](Self::connect).
pub struct ConnectionManager {
    /// State shared with the connection task.
    shared: Shared,
    /// The connection task, `None` before the first connect and after
    /// `disconnect()`.
    task: Mutex<Option<TaskHandle>>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state. Nothing is opened until
    /// [`connect`](Self::connect).
    pub fn new(
        settings: ConnectionSettings,
        session: AuthSessionStore,
        transport: Arc<dyn WsTransport>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            shared: Shared {
                settings: Arc::new(settings),
                session,
                transport,
                dispatcher: MessageDispatcher::new(),
                subscriptions: Arc::new(Mutex::new(Subscriptions::new())),
                state_tx: Arc::new(state_tx),
                transitions,
                attempts: Arc::new(AtomicU32::new(0)),
            },
            task: Mutex::new(None),
        }
    }

    /// Handler registry for inbound frames. Registrations outlive reconnects.
    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.shared.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch the connection state. A `watch` channel keeps only the latest
    /// value, so a slow reader can miss short-lived states.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Every state change in order, including short-lived ones the
    /// [`state_receiver`](Self::state_receiver) may skip.
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.transitions.subscribe()
    }

    /// Consecutive reconnect attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Start the connection if it is not already running.
    ///
    /// Without a valid credential this is a no-op that leaves the state
    /// `Disconnected`. A `Failed` connection stays failed; use
    /// [`force_reconnect`](Self::force_reconnect) to leave it.
    pub async fn connect(&self) -> ConnectionState {
        if !self.shared.session.has_valid_credential() {
            warn!("socket connect skipped: no credential");
            return self.state();
        }

        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.as_ref() {
            if !handle.join.is_finished() {
                if self.state() == ConnectionState::Disconnected {
                    // Parked after a server close or a missing credential.
                    if handle.cmd_tx.send(Command::Reconnect).is_ok() {
                        return self.state();
                    }
                } else {
                    debug!("socket already running ({}), reusing", self.state());
                    return self.state();
                }
            }
        }

        *task = Some(self.spawn_task());
        self.state()
    }

    /// Tear down any current connection and connect again immediately with a
    /// fresh attempt counter. Works from every state, including `Failed`.
    pub async fn force_reconnect(&self) -> ConnectionState {
        if !self.shared.session.has_valid_credential() {
            warn!("forced reconnect skipped: no credential");
            return self.state();
        }

        info!("forced socket reconnect");
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.as_ref() {
            if !handle.join.is_finished() && handle.cmd_tx.send(Command::Reconnect).is_ok() {
                return self.state();
            }
        }
        *task = Some(self.spawn_task());
        self.state()
    }

    /// Close the connection and cancel every pending reconnect and heartbeat.
    pub async fn disconnect(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut handle) = handle {
            let _ = handle.cmd_tx.send(Command::Disconnect);
            match tokio::time::timeout(self.shared.settings.shutdown_timeout, &mut handle.join).await {
                Ok(_) => debug!("socket task stopped"),
                Err(_) => {
                    warn!("socket task did not stop in time, aborting");
                    handle.join.abort();
                }
            }
        }

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Send a frame on the open channel.
    ///
    /// Fails with [`FleetError::NotConnected`] unless the state is `Connected`.
    /// Frames are never buffered for later.
    pub fn send(&self, frame: &OutboundFrame) -> FleetResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(FleetError::NotConnected);
        }
        let text = frame.to_json()?;
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = task.as_ref() else {
            return Err(FleetError::NotConnected);
        };
        debug!("socket send {}", frame.kind());
        handle
            .cmd_tx
            .send(Command::Send(text))
            .map_err(|_| FleetError::NotConnected)
    }

    /// Declare interest in `topic`. The active set is re-sent when it changes
    /// while connected and on every reconnect.
    pub fn acquire_topic(&self, topic: impl Into<String>) {
        let changed = self
            .shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acquire(topic);
        if changed {
            self.resubscribe();
        }
    }

    pub fn release_topic(&self, topic: &str) {
        let changed = self
            .shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(topic);
        if changed {
            self.resubscribe();
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared.topics()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
    }

    fn resubscribe(&self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = task.as_ref() {
            let _ = handle.cmd_tx.send(Command::Resubscribe);
        }
    }

    fn spawn_task(&self) -> TaskHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
        let task = ConnectionTask {
            shared: self.shared.clone(),
            cmd_rx,
        };
        TaskHandle {
            cmd_tx,
            join: tokio::spawn(task.run()),
        }
    }
}

/// How a live connection ended.
enum Exit {
    /// Disconnect requested or the manager was dropped.
    Stop,
    /// Forced reconnect: go again now.
    Restart,
    /// Channel closed or died. `Some(1000)` is a clean close.
    Closed(Option<u16>),
}

/// Outcome of waiting while no channel is open.
enum Wake {
    Stop,
    Restart,
}

struct ConnectionTask {
    shared: Shared,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl ConnectionTask {
    async fn run(mut self) {
        'connect: loop {
            let url = match self.shared.socket_url() {
                Ok(Some(url)) => url,
                Ok(None) => {
                    warn!("socket has no credential, parking");
                    match self.park(ConnectionState::Disconnected).await {
                        Wake::Restart => continue 'connect,
                        Wake::Stop => return,
                    }
                }
                Err(e) => {
                    error!("cannot build socket url: {e}");
                    match self.park(ConnectionState::Failed).await {
                        Wake::Restart => continue 'connect,
                        Wake::Stop => return,
                    }
                }
            };

            info!("socket opening {}", redact_url(&url));
            let opened = {
                let transport = self.shared.transport.clone();
                let open = transport.open(&url);
                tokio::pin!(open);
                loop {
                    tokio::select! {
                        biased;
                        cmd = self.cmd_rx.recv() => match self.idle_command(cmd) {
                            Some(Wake::Stop) => {
                                self.shared.set_state(ConnectionState::Disconnected);
                                return;
                            }
                            Some(Wake::Restart) => continue 'connect,
                            None => {}
                        },
                        result = &mut open => break result,
                    }
                }
            };

            match opened {
                Ok(channel) => {
                    self.shared.attempts.store(0, Ordering::SeqCst);
                    match self.run_connection(channel).await {
                        Exit::Stop => {
                            self.shared.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        Exit::Restart => {
                            self.restart();
                            continue 'connect;
                        }
                        Exit::Closed(Some(close_codes::NORMAL)) => {
                            info!("socket closed normally by server");
                            match self.park(ConnectionState::Disconnected).await {
                                Wake::Restart => continue 'connect,
                                Wake::Stop => return,
                            }
                        }
                        Exit::Closed(code) => {
                            warn!(
                                "socket closed (code {})",
                                code.unwrap_or(close_codes::ABNORMAL)
                            );
                        }
                    }
                }
                Err(e) => warn!("socket open failed: {e}"),
            }

            let attempt = self.shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let reconnect = &self.shared.settings.reconnect;
            if attempt > reconnect.max_attempts {
                self.shared.attempts.store(reconnect.max_attempts, Ordering::SeqCst);
                error!(
                    "{}",
                    FleetError::MaxReconnectAttempts(reconnect.max_attempts)
                );
                match self.park(ConnectionState::Failed).await {
                    Wake::Restart => continue 'connect,
                    Wake::Stop => return,
                }
            }

            let delay = apply_jitter(
                reconnect_delay(reconnect.base_delay, reconnect.max_delay, attempt),
                reconnect.jitter_factor,
            );
            self.shared.set_state(ConnectionState::Reconnecting);
            info!(
                "socket reconnect attempt {attempt}/{} in {:.1}s",
                reconnect.max_attempts,
                delay.as_secs_f64()
            );

            let backoff = sleep(delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    biased;
                    cmd = self.cmd_rx.recv() => match self.idle_command(cmd) {
                        Some(Wake::Stop) => {
                            self.shared.set_state(ConnectionState::Disconnected);
                            return;
                        }
                        Some(Wake::Restart) => continue 'connect,
                        None => {}
                    },
                    _ = &mut backoff => break,
                }
            }
        }
    }

    fn restart(&self) {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Connecting);
    }

    /// Handle a command while no channel is open. `None` means keep waiting.
    fn idle_command(&self, cmd: Option<Command>) -> Option<Wake> {
        match cmd {
            None | Some(Command::Disconnect) => Some(Wake::Stop),
            Some(Command::Reconnect) => {
                self.restart();
                Some(Wake::Restart)
            }
            Some(Command::Send(_)) => {
                debug!("dropping outbound frame: not connected");
                None
            }
            Some(Command::Resubscribe) => None,
        }
    }

    /// Sit in `state` with no timers armed until told to reconnect or stop.
    async fn park(&mut self, state: ConnectionState) -> Wake {
        self.shared.set_state(state);
        loop {
            let cmd = self.cmd_rx.recv().await;
            if let Some(wake) = self.idle_command(cmd) {
                if matches!(wake, Wake::Stop) {
                    self.shared.set_state(ConnectionState::Disconnected);
                }
                return wake;
            }
        }
    }

    async fn send_frame(channel: &mut Box<dyn WsChannel>, frame: &OutboundFrame) -> FleetResult<()> {
        channel.send_text(frame.to_json()?).await
    }

    async fn run_connection(&mut self, mut channel: Box<dyn WsChannel>) -> Exit {
        let Some(token) = self.shared.session.access_token() else {
            channel.close(close_codes::NORMAL, "signed out").await;
            return Exit::Stop;
        };

        if let Err(e) = Self::send_frame(&mut channel, &OutboundFrame::Authenticate { token }).await {
            warn!("authenticate failed: {e}");
            return Exit::Closed(None);
        }
        let topics = self.shared.topics();
        if !topics.is_empty() {
            debug!("subscribing to {}", topics.join(", "));
            if let Err(e) = Self::send_frame(&mut channel, &OutboundFrame::Subscribe { topics }).await {
                warn!("subscribe failed: {e}");
                return Exit::Closed(None);
            }
        }
        self.shared.set_state(ConnectionState::Connected);

        let heartbeat = self.shared.settings.heartbeat.clone();
        let mut idle_deadline = Instant::now() + heartbeat.interval;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let idle = sleep_until(idle_deadline);
            tokio::pin!(idle);

            tokio::select! {
                biased;

                _ = sleep_until(pong_deadline.unwrap_or(idle_deadline)), if pong_deadline.is_some() => {
                    warn!("no traffic within {:?} of ping, dropping connection", heartbeat.pong_timeout);
                    return Exit::Closed(None);
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(text)) => {
                        if let Err(e) = channel.send_text(text).await {
                            warn!("socket send failed: {e}");
                            return Exit::Closed(None);
                        }
                    }
                    Some(Command::Resubscribe) => {
                        let topics = self.shared.topics();
                        if let Err(e) = Self::send_frame(&mut channel, &OutboundFrame::Subscribe { topics }).await {
                            warn!("subscribe failed: {e}");
                            return Exit::Closed(None);
                        }
                    }
                    Some(Command::Reconnect) => {
                        channel.close(close_codes::NORMAL, "reconnecting").await;
                        return Exit::Restart;
                    }
                    Some(Command::Disconnect) | None => {
                        channel.close(close_codes::NORMAL, "client disconnect").await;
                        return Exit::Stop;
                    }
                },

                _ = &mut idle, if pong_deadline.is_none() => {
                    debug!("socket idle, sending ping");
                    if let Err(e) = Self::send_frame(&mut channel, &OutboundFrame::Ping).await {
                        warn!("ping failed: {e}");
                        return Exit::Closed(None);
                    }
                    pong_deadline = Some(Instant::now() + heartbeat.pong_timeout);
                }

                event = channel.next_event() => {
                    idle_deadline = Instant::now() + heartbeat.interval;
                    pong_deadline = None;

                    match event {
                        WsEvent::Text(text) => {
                            if let Some(exit) = self.handle_text(&mut channel, &text).await {
                                return exit;
                            }
                        }
                        WsEvent::Activity => {}
                        WsEvent::Closed { code, reason } => {
                            debug!("socket close frame {:?}: {reason}", code);
                            return Exit::Closed(code);
                        }
                        WsEvent::Error(e) => {
                            warn!("socket read error: {e}");
                            return Exit::Closed(None);
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(&self, channel: &mut Box<dyn WsChannel>, text: &str) -> Option<Exit> {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{e}");
                return None;
            }
        };

        match frame.kind {
            FrameKind::Ping => {
                if let Err(e) = Self::send_frame(channel, &OutboundFrame::Pong).await {
                    warn!("pong failed: {e}");
                    return Some(Exit::Closed(None));
                }
            }
            FrameKind::Pong => debug!("pong received"),
            _ => {
                self.shared.dispatcher.dispatch(&frame);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockWsTransport;
    use fleet_core::session::Credential;
    use fleet_core::storage::MemoryStore;
    use serde_json::{json, Value};

    fn session_with_credential() -> AuthSessionStore {
        let session = AuthSessionStore::load(Arc::new(MemoryStore::new())).unwrap();
        session
            .set(Credential::new("tok-1", "ref-1", "driver-7").with_user_type("driver"))
            .unwrap();
        session
    }

    fn manager(ws: &MockWsTransport, session: AuthSessionStore) -> ConnectionManager {
        let mut settings = ConnectionSettings::new("wss://fleet.test/ws");
        settings.reconnect.max_attempts = 10;
        ConnectionManager::new(settings, session, Arc::new(ws.clone()))
    }

    async fn wait_for(manager: &ConnectionManager, state: ConnectionState) {
        let mut rx = manager.state_receiver();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_credential_stays_disconnected() {
        let ws = MockWsTransport::new();
        let session = AuthSessionStore::load(Arc::new(MemoryStore::new())).unwrap();
        let manager = manager(&ws, session);

        assert_eq!(manager.connect().await, ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ws.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_order_and_url() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());
        manager.acquire_topic("vehicles");
        manager.acquire_topic("alerts");

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;

        let frames = server.received_frames();
        assert_eq!(frames[0], json!({"type": "authenticate", "token": "tok-1"}));
        assert_eq!(frames[1], json!({"type": "subscribe", "topics": ["alerts", "vehicles"]}));

        let url = &ws.opens()[0].url;
        assert!(url.starts_with("wss://fleet.test/ws?"));
        assert!(url.contains("token=tok-1"));
        assert!(url.contains("userId=driver-7"));
        assert!(url.contains("userType=driver"));

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_changes_include_connecting() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());
        let mut changes = manager.state_changes();

        manager.connect().await;
        let _server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        manager.disconnect().await;

        let mut seen = Vec::new();
        while let Ok(state) = changes.try_recv() {
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_connected() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());
        let frame = OutboundFrame::trip_status_update("T-1", "started");

        assert!(matches!(manager.send(&frame), Err(FleetError::NotConnected)));

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        manager.send(&frame).unwrap();

        let sent: Value = server.next_frame().await.unwrap();
        // authenticate comes first; no topics so no subscribe
        assert_eq!(sent["type"], "authenticate");
        let sent = server.next_frame().await.unwrap();
        assert_eq!(sent["type"], "trip_status_update");
        assert_eq!(sent["tripId"], "T-1");

        manager.disconnect().await;
        assert!(matches!(manager.send(&frame), Err(FleetError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_schedule_then_failed() {
        let ws = MockWsTransport::new();
        ws.fail_opens(u32::MAX);
        let manager = manager(&ws, session_with_credential());

        manager.connect().await;
        wait_for(&manager, ConnectionState::Failed).await;

        let opens = ws.opens();
        assert_eq!(opens.len(), 11);
        let gaps: Vec<u64> = opens
            .windows(2)
            .map(|w| (w[1].at - w[0].at).as_millis() as u64)
            .collect();
        assert_eq!(
            gaps,
            vec![5_000, 10_000, 20_000, 30_000, 30_000, 30_000, 30_000, 30_000, 30_000, 30_000]
        );

        // Failed is terminal until forced.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ws.open_count(), 11);
        assert_eq!(manager.connect().await, ConnectionState::Failed);
        assert_eq!(ws.open_count(), 11);

        ws.fail_opens(0);
        manager.force_reconnect().await;
        let _server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(ws.open_count(), 12);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_resubscribes_before_dispatch() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());
        manager.acquire_topic("vehicles");

        let log = ws.log();
        let handler_log = log.clone();
        manager.dispatcher().on(FrameKind::VehicleUpdate, move |frame| {
            let id = frame.as_vehicle_update().map(|u| u.vehicle_id).unwrap_or_default();
            handler_log.lock().unwrap().push(format!("handler:{id}"));
            Ok(())
        });

        manager.connect().await;
        let first = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;

        let dropped_at = Instant::now();
        first.close(close_codes::ABNORMAL);
        wait_for(&manager, ConnectionState::Reconnecting).await;
        assert_eq!(manager.reconnect_attempts(), 1);

        let second = ws.next_server().await;
        assert_eq!(ws.opens()[1].at - dropped_at, Duration::from_secs(5));
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(manager.reconnect_attempts(), 0);

        second.send(json!({"type": "vehicle_update", "payload": {"vehicleId": "V-42"}}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let log = log.lock().unwrap().clone();
        let second_subscribe = log
            .iter()
            .rposition(|entry| entry.contains(r#""type":"subscribe""#))
            .unwrap();
        let handled = log.iter().position(|entry| entry == "handler:V-42").unwrap();
        assert!(second_subscribe < handled);
        assert_eq!(log.iter().filter(|e| e.contains("subscribe")).count(), 2);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_attempt_after_disconnect() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;

        server.close(close_codes::ABNORMAL);
        wait_for(&manager, ConnectionState::Reconnecting).await;
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(ws.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_server_close_does_not_reconnect() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;

        server.close(close_codes::NORMAL);
        wait_for(&manager, ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ws.open_count(), 1);

        // connect() revives a parked connection.
        manager.connect().await;
        let _again = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_ping_answered_not_dispatched() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        manager.dispatcher().on(FrameKind::Ping, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(server.next_frame().await.unwrap()["type"], "authenticate");

        server.send(json!({"type": "ping"}));
        assert_eq!(server.next_frame().await.unwrap(), json!({"type": "pong"}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_forces_reconnect() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        let connected_at = Instant::now();
        assert_eq!(server.next_frame().await.unwrap()["type"], "authenticate");

        assert_eq!(server.next_frame().await.unwrap(), json!({"type": "ping"}));
        assert_eq!(Instant::now() - connected_at, Duration::from_secs(30));

        // No reply: dropped after the pong timeout, reopened after the first backoff.
        let _second = ws.next_server().await;
        assert_eq!(ws.opens()[1].at - connected_at, Duration::from_secs(45));

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_resets_heartbeat() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(server.next_frame().await.unwrap()["type"], "authenticate");

        tokio::time::sleep(Duration::from_secs(20)).await;
        let reset_at = Instant::now();
        server.send(json!({"type": "notification", "payload": {}}));

        assert_eq!(server.next_frame().await.unwrap()["type"], "ping");
        assert_eq!(Instant::now() - reset_at, Duration::from_secs(30));

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_change_while_connected_resubscribes() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());
        manager.acquire_topic("trips");

        manager.connect().await;
        let server = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;
        server.next_frame().await.unwrap();
        server.next_frame().await.unwrap();

        manager.acquire_topic("trips");
        manager.acquire_topic("alerts");
        assert_eq!(
            server.next_frame().await.unwrap(),
            json!({"type": "subscribe", "topics": ["alerts", "trips"]})
        );

        manager.release_topic("trips");
        manager.release_topic("trips");
        assert_eq!(
            server.next_frame().await.unwrap(),
            json!({"type": "subscribe", "topics": ["alerts"]})
        );

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_reconnect_while_connected() {
        let ws = MockWsTransport::new();
        let manager = manager(&ws, session_with_credential());

        manager.connect().await;
        let first = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;

        manager.force_reconnect().await;
        let _second = ws.next_server().await;
        wait_for(&manager, ConnectionState::Connected).await;

        assert_eq!(first.closed_with(), Some(close_codes::NORMAL));
        assert_eq!(ws.open_count(), 2);
        assert_eq!(ws.opens()[1].at, ws.opens()[0].at);

        manager.disconnect().await;
    }
}
