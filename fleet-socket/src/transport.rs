//! WebSocket transport seam.
//!
//! The connection manager only needs "open a channel to this URL", "send a
//! text frame", "wait for the next event" and "close". Production uses
//! tokio-tungstenite; tests substitute [`crate::testing::MockWsTransport`].

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use fleet_core::error::{FleetError, FleetResult};

/// Something observed on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WsEvent {
    /// A text frame (JSON).
    Text(String),
    /// Traffic with no application payload (transport-level ping/pong).
    Activity,
    /// The channel closed. `code` is `None` when it dropped without a close frame.
    Closed { code: Option<u16>, reason: String },
    /// Read error; the channel is unusable.
    Error(String),
}

#[async_trait]
pub trait WsChannel: Send {
    async fn send_text(&mut self, text: String) -> FleetResult<()>;

    /// Next event. Must be cancel-safe: it is polled inside `select!`.
    async fn next_event(&mut self) -> WsEvent;

    async fn close(&mut self, code: u16, reason: &str);
}

#[async_trait]
pub trait WsTransport: Send + Sync {
    async fn open(&self, url: &str) -> FleetResult<Box<dyn WsChannel>>;
}

pub struct TungsteniteTransport {
    connect_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl WsTransport for TungsteniteTransport {
    async fn open(&self, url: &str) -> FleetResult<Box<dyn WsChannel>> {
        let connect = tokio_tungstenite::connect_async(url);
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| FleetError::Socket("connect timed out".into()))?
            .map_err(|e| FleetError::Socket(format!("connect failed: {e}")))?;
        debug!("websocket handshake status {}", response.status());
        Ok(Box::new(TungsteniteChannel { stream }))
    }
}

struct TungsteniteChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WsChannel for TungsteniteChannel {
    async fn send_text(&mut self, text: String) -> FleetResult<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| FleetError::Socket(format!("send failed: {e}")))
    }

    async fn next_event(&mut self) -> WsEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return WsEvent::Text(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => WsEvent::Text(text),
                        Err(_) => WsEvent::Activity,
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.stream.send(Message::Pong(payload)).await;
                    return WsEvent::Activity;
                }
                Some(Ok(Message::Pong(_))) => return WsEvent::Activity,
                Some(Ok(Message::Close(frame))) => {
                    return WsEvent::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    }
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => return WsEvent::Error(e.to_string()),
                None => {
                    return WsEvent::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    }
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!("close handshake failed: {e}");
        }
    }
}
