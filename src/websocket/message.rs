use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dispatch::{Envelope, EventType};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Typing {
        circle_id: String,
        is_typing: bool,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        battery: Option<u8>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Ping => "ping",
            ClientMessage::Typing { .. } => "typing",
            ClientMessage::Location { .. } => "location",
        }
    }
}

/// Hub-generated control frames (not envelopes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Connected {
        connection_id: Uuid,
        rooms: Vec<String>,
    },
    Pong,
    Heartbeat,
    Error {
        code: String,
        message: String,
    },
    RateLimited {
        retry_after: u64,
        limit: u32,
        reset_at: i64,
    },
    Closing {
        reason: String,
    },
}

impl ControlMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn closing(reason: impl Into<String>) -> Self {
        Self::Closing {
            reason: reason.into(),
        }
    }
}

/// Item held in a connection's outbound queue
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Envelope serialized once per dispatch and shared across connections
    Envelope {
        event_type: EventType,
        frame: Arc<str>,
    },
    Control(ControlMessage),
}

impl OutboundMessage {
    pub fn envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(envelope)?;
        Ok(Self::Envelope {
            event_type: envelope.event_type,
            frame: Arc::from(json),
        })
    }

    /// Whether drop-oldest backpressure may discard this item
    pub fn is_evictable(&self) -> bool {
        match self {
            OutboundMessage::Envelope { event_type, .. } => !event_type.is_critical(),
            OutboundMessage::Control(ControlMessage::Heartbeat)
            | OutboundMessage::Control(ControlMessage::Pong) => true,
            OutboundMessage::Control(_) => false,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Envelope { frame, .. } => Ok(frame.to_string()),
            OutboundMessage::Control(control) => serde_json::to_string(control),
        }
    }
}

impl From<ControlMessage> for OutboundMessage {
    fn from(control: ControlMessage) -> Self {
        OutboundMessage::Control(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_messages() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let typing: ClientMessage = serde_json::from_value(json!({
            "type": "typing",
            "payload": {"circle_id": "c1", "is_typing": true}
        }))
        .unwrap();
        assert!(matches!(typing, ClientMessage::Typing { is_typing: true, .. }));

        let location: ClientMessage = serde_json::from_value(json!({
            "type": "location",
            "payload": {"latitude": 52.1, "longitude": 4.3}
        }))
        .unwrap();
        match location {
            ClientMessage::Location {
                latitude, accuracy, ..
            } => {
                assert_eq!(latitude, 52.1);
                assert!(accuracy.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_client_message_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_control_wire_shape() {
        let json = serde_json::to_value(ControlMessage::RateLimited {
            retry_after: 12,
            limit: 5,
            reset_at: 1000,
        })
        .unwrap();
        assert_eq!(json["type"], "rate_limited");
        assert_eq!(json["retry_after"], 12);
    }

    #[test]
    fn test_evictable_items() {
        let alert = Envelope::to_room(EventType::EmergencyAlert, "c1", json!({}));
        let location = Envelope::to_room(EventType::LocationUpdate, "c1", json!({}));

        assert!(!OutboundMessage::envelope(&alert).unwrap().is_evictable());
        assert!(OutboundMessage::envelope(&location).unwrap().is_evictable());
        assert!(OutboundMessage::from(ControlMessage::Heartbeat).is_evictable());
        assert!(!OutboundMessage::from(ControlMessage::closing("bye")).is_evictable());
    }

    #[test]
    fn test_preserialized_frame_round_trips() {
        let envelope = Envelope::to_user(EventType::Notification, "u1", json!({"title": "hi"}));
        let outbound = OutboundMessage::envelope(&envelope).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&outbound.to_json().unwrap()).unwrap();
        assert_eq!(parsed["type"], "notification");
        assert_eq!(parsed["payload"]["title"], "hi");
    }
}
