//! In-process WebSocket transport for tests.
//!
//! Every successful `open` yields a [`ServerHandle`] that plays the server
//! side: push frames to the client, close with a code, and read what the
//! client sent.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use fleet_core::error::{FleetError, FleetResult};

use crate::transport::{WsChannel, WsEvent, WsTransport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One `open` call as seen by the mock, with the (possibly paused) clock reading.
#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub url: String,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Default)]
struct Script {
    opens: Vec<OpenRecord>,
    fail_remaining: u32,
}

#[derive(Clone)]
pub struct MockWsTransport {
    script: Arc<Mutex<Script>>,
    log: Arc<Mutex<Vec<String>>>,
    servers_tx: mpsc::UnboundedSender<ServerHandle>,
    servers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerHandle>>>,
}

impl Default for MockWsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWsTransport {
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            log: Arc::new(Mutex::new(Vec::new())),
            servers_tx,
            servers_rx: Arc::new(tokio::sync::Mutex::new(servers_rx)),
        }
    }

    /// Refuse the next `n` opens.
    pub fn fail_opens(&self, n: u32) {
        lock(&self.script).fail_remaining = n;
    }

    pub fn opens(&self) -> Vec<OpenRecord> {
        lock(&self.script).opens.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.script).opens.len()
    }

    /// Every text frame any client sent, in order. Tests may push their own
    /// markers here to check ordering against the wire.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    /// Wait for the next successful open.
    pub async fn next_server(&self) -> ServerHandle {
        match self.servers_rx.lock().await.recv().await {
            Some(server) => server,
            None => panic!("mock transport dropped"),
        }
    }
}

#[async_trait]
impl WsTransport for MockWsTransport {
    async fn open(&self, url: &str) -> FleetResult<Box<dyn WsChannel>> {
        let refuse = {
            let mut script = lock(&self.script);
            let refuse = script.fail_remaining > 0;
            if refuse {
                script.fail_remaining -= 1;
            }
            script.opens.push(OpenRecord {
                url: url.to_string(),
                at: Instant::now(),
                succeeded: !refuse,
            });
            refuse
        };
        if refuse {
            return Err(FleetError::Socket("connection refused".into()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let received = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(None));

        let server = ServerHandle {
            events: events_tx,
            outbound: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            received: received.clone(),
            closed: closed.clone(),
        };
        let _ = self.servers_tx.send(server);

        Ok(Box::new(MockChannel {
            events: events_rx,
            outbound: outbound_tx,
            received,
            closed,
            log: self.log.clone(),
        }))
    }
}

struct MockChannel {
    events: mpsc::UnboundedReceiver<WsEvent>,
    outbound: mpsc::UnboundedSender<String>,
    received: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<u16>>>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl WsChannel for MockChannel {
    async fn send_text(&mut self, text: String) -> FleetResult<()> {
        if lock(&self.closed).is_some() {
            return Err(FleetError::Socket("channel closed".into()));
        }
        lock(&self.log).push(text.clone());
        lock(&self.received).push(text.clone());
        let _ = self.outbound.send(text);
        Ok(())
    }

    async fn next_event(&mut self) -> WsEvent {
        self.events.recv().await.unwrap_or(WsEvent::Closed {
            code: None,
            reason: "server handle dropped".into(),
        })
    }

    async fn close(&mut self, code: u16, _reason: &str) {
        *lock(&self.closed) = Some(code);
    }
}

/// Server side of one mock connection.
#[derive(Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<WsEvent>,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    received: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<Option<u16>>>,
}

impl ServerHandle {
    pub fn send(&self, frame: Value) {
        self.send_text(frame.to_string());
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.events.send(WsEvent::Text(text.into()));
    }

    /// Transport-level traffic with no frame.
    pub fn activity(&self) {
        let _ = self.events.send(WsEvent::Activity);
    }

    pub fn close(&self, code: u16) {
        let _ = self.events.send(WsEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    pub fn drop_connection(&self) {
        let _ = self.events.send(WsEvent::Closed {
            code: None,
            reason: "reset".into(),
        });
    }

    /// Next frame the client sent, waiting for it if needed.
    pub async fn next_frame(&self) -> Option<Value> {
        let text = self.outbound.lock().await.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Everything the client sent so far.
    pub fn received_frames(&self) -> Vec<Value> {
        lock(&self.received)
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Close code the client used, if it closed this connection.
    pub fn closed_with(&self) -> Option<u16> {
        *lock(&self.closed)
    }
}
