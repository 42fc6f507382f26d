//! Wire frames for the fleet event socket.
//!
//! Every message is one JSON object. Inbound frames are `{type, payload}`;
//! outbound frames are `{type, ...fields}` with domain frames also carrying a
//! `timestamp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::error::{FleetError, FleetResult};

/// Kinds of inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameKind {
    /// Position/status change for a vehicle (`vehicle_update`).
    VehicleUpdate,
    /// Trip lifecycle change (`trip_update`).
    TripUpdate,
    /// Operational alert with a severity (`fleet_alert`).
    FleetAlert,
    /// User-facing notification (`notification`).
    Notification,
    /// Server-initiated liveness check (`ping`).
    Ping,
    /// Reply to a client ping (`pong`).
    Pong,
    /// Server-reported error (`error`).
    Error,
    /// Anything this client does not know yet.
    Unknown(String),
}

impl FrameKind {
    pub fn from_str(s: &str) -> Self {
        match s {
            "vehicle_update" => Self::VehicleUpdate,
            "trip_update" => Self::TripUpdate,
            "fleet_alert" => Self::FleetAlert,
            "notification" => Self::Notification,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "error" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::VehicleUpdate => "vehicle_update",
            Self::TripUpdate => "trip_update",
            Self::FleetAlert => "fleet_alert",
            Self::Notification => "notification",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
            Self::Unknown(s) => s.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// A received frame. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub kind: FrameKind,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundFrame {
    pub fn parse(text: &str) -> FleetResult<Self> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| FleetError::Socket(format!("malformed frame: {e}")))?;
        Ok(Self {
            kind: FrameKind::from_str(&raw.kind),
            payload: raw.payload,
            received_at: Utc::now(),
        })
    }

    pub fn as_vehicle_update(&self) -> Option<VehicleUpdate> {
        self.decode(FrameKind::VehicleUpdate)
    }

    pub fn as_trip_update(&self) -> Option<TripUpdate> {
        self.decode(FrameKind::TripUpdate)
    }

    pub fn as_fleet_alert(&self) -> Option<FleetAlert> {
        self.decode(FrameKind::FleetAlert)
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, kind: FrameKind) -> Option<T> {
        if self.kind == kind {
            serde_json::from_value(self.payload.clone()).ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetAlert {
    #[serde(default)]
    pub id: Option<String>,
    pub severity: AlertSeverity,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
}

impl FleetAlert {
    pub fn is_critical(&self) -> bool {
        self.severity == AlertSeverity::Critical
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleUpdate {
    pub vehicle_id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripUpdate {
    pub trip_id: String,
    pub status: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub driver_id: Option<String>,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Authenticate {
        token: String,
    },
    Subscribe {
        topics: Vec<String>,
    },
    Ping,
    Pong,
    LocationUpdate {
        vehicle_id: String,
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    TripStatusUpdate {
        trip_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    EmergencyAlert {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vehicle_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latitude: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        longitude: Option<f64>,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundFrame {
    pub fn location_update(vehicle_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self::LocationUpdate {
            vehicle_id: vehicle_id.into(),
            latitude,
            longitude,
            speed: None,
            heading: None,
            timestamp: Utc::now(),
        }
    }

    pub fn trip_status_update(trip_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::TripStatusUpdate {
            trip_id: trip_id.into(),
            status: status.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn emergency_alert(message: impl Into<String>, vehicle_id: Option<String>) -> Self {
        Self::EmergencyAlert {
            message: message.into(),
            vehicle_id,
            latitude: None,
            longitude: None,
            timestamp: Utc::now(),
        }
    }

    /// Wire name, for logging. Never includes field values.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Subscribe { .. } => "subscribe",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::LocationUpdate { .. } => "location_update",
            Self::TripStatusUpdate { .. } => "trip_status_update",
            Self::EmergencyAlert { .. } => "emergency_alert",
        }
    }

    pub fn to_json(&self) -> FleetResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_kind_parsing() {
        assert_eq!(FrameKind::from_str("fleet_alert"), FrameKind::FleetAlert);
        assert_eq!(FrameKind::from_str("ping"), FrameKind::Ping);
        assert_eq!(
            FrameKind::from_str("geofence_breach"),
            FrameKind::Unknown("geofence_breach".into())
        );
        assert!(!FrameKind::from_str("geofence_breach").is_known());
        assert_eq!(FrameKind::TripUpdate.to_string(), "trip_update");
    }

    #[test]
    fn test_parse_inbound() {
        let frame = InboundFrame::parse(
            r#"{"type":"vehicle_update","payload":{"vehicleId":"TRK-9","latitude":52.1,"longitude":4.3}}"#,
        )
        .unwrap();
        assert_eq!(frame.kind, FrameKind::VehicleUpdate);
        let update = frame.as_vehicle_update().unwrap();
        assert_eq!(update.vehicle_id, "TRK-9");
        assert!(frame.as_trip_update().is_none());

        let ping = InboundFrame::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping.kind, FrameKind::Ping);
        assert!(ping.payload.is_null());

        assert!(InboundFrame::parse("not json").is_err());
        assert!(InboundFrame::parse(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_alert_severity() {
        let frame = InboundFrame::parse(
            r#"{"type":"fleet_alert","payload":{"severity":"critical","title":"Collision","vehicleId":"V1"}}"#,
        )
        .unwrap();
        assert!(frame.as_fleet_alert().unwrap().is_critical());

        let odd: FleetAlert = serde_json::from_value(json!({"severity": "emergency"})).unwrap();
        assert_eq!(odd.severity, AlertSeverity::Other);
    }

    #[test]
    fn test_outbound_shapes() {
        let auth: Value =
            serde_json::from_str(&OutboundFrame::Authenticate { token: "t".into() }.to_json().unwrap()).unwrap();
        assert_eq!(auth, json!({"type": "authenticate", "token": "t"}));

        let sub: Value = serde_json::from_str(
            &OutboundFrame::Subscribe { topics: vec!["vehicles".into(), "alerts".into()] }
                .to_json()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(sub, json!({"type": "subscribe", "topics": ["vehicles", "alerts"]}));

        let pong: Value = serde_json::from_str(&OutboundFrame::Pong.to_json().unwrap()).unwrap();
        assert_eq!(pong, json!({"type": "pong"}));

        let loc: Value =
            serde_json::from_str(&OutboundFrame::location_update("V7", 1.5, 2.5).to_json().unwrap()).unwrap();
        assert_eq!(loc["type"], "location_update");
        assert_eq!(loc["vehicleId"], "V7");
        assert!(loc.get("speed").is_none());
        assert!(loc["timestamp"].is_string());
    }
}
