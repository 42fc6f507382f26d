//! FleetOps Socket - Real-time event channel.
//!
//! Maintains the WebSocket connection to the fleet event server, reconnects
//! with capped exponential backoff, and routes inbound frames to handlers
//! registered by frame kind.

pub mod dispatcher;
pub mod frames;
pub mod manager;
pub mod state;
pub mod subscriptions;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use dispatcher::{HandlerId, MessageDispatcher};
pub use frames::{
    AlertSeverity, FleetAlert, FrameKind, InboundFrame, OutboundFrame, TripUpdate, VehicleUpdate,
};
pub use manager::{ConnectionManager, ConnectionSettings, HeartbeatConfig, ReconnectConfig};
pub use state::ConnectionState;
pub use subscriptions::Subscription;
pub use transport::{TungsteniteTransport, WsChannel, WsEvent, WsTransport};
