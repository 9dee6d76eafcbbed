//! Broadcast envelope types.
//!
//! The envelope is the wire schema for every service-originated event:
//! `{"type": ..., "scope": {...}, "payload": ...}` plus an id and timestamp.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Known envelope types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    LocationUpdate,
    PlaceEvent,
    EmergencyAlert,
    ChatMessage,
    Notification,
    PresenceChange,
    TypingIndicator,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::LocationUpdate => "location_update",
            EventType::PlaceEvent => "place_event",
            EventType::EmergencyAlert => "emergency_alert",
            EventType::ChatMessage => "chat_message",
            EventType::Notification => "notification",
            EventType::PresenceChange => "presence_change",
            EventType::TypingIndicator => "typing_indicator",
        }
    }

    /// Critical envelopes must never be dropped silently.
    pub fn is_critical(&self) -> bool {
        matches!(self, EventType::EmergencyAlert)
    }

    /// Built-in backpressure policy, overridable through `DispatchConfig`.
    pub fn default_policy(&self) -> BackpressurePolicy {
        match self {
            EventType::LocationUpdate | EventType::TypingIndicator | EventType::PresenceChange => {
                BackpressurePolicy::DropOldest
            }
            EventType::PlaceEvent | EventType::ChatMessage | EventType::Notification => {
                BackpressurePolicy::DropNewest
            }
            EventType::EmergencyAlert => BackpressurePolicy::ProbeAndEvict,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a connection's outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Evict the oldest evictable queued item to make room
    DropOldest,
    /// Refuse the new item and log it
    DropNewest,
    /// Refuse the new item, log it at error level and schedule a liveness
    /// probe; an unresponsive connection is disconnected
    ProbeAndEvict,
}

impl BackpressurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressurePolicy::DropOldest => "drop_oldest",
            BackpressurePolicy::DropNewest => "drop_newest",
            BackpressurePolicy::ProbeAndEvict => "probe_and_evict",
        }
    }
}

/// Target scope of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Scope {
    /// Every connection subscribed to a circle's room
    Room(String),
    /// Every connection of one user
    User(String),
    /// Every live connection
    All,
}

impl Scope {
    pub fn label(&self) -> &'static str {
        match self {
            Scope::Room(_) => "room",
            Scope::User(_) => "user",
            Scope::All => "all",
        }
    }
}

/// Event envelope fanned out to connections. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub scope: Scope,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event_type: EventType, scope: Scope, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            scope,
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn to_room(
        event_type: EventType,
        room_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(event_type, Scope::Room(room_id.into()), payload)
    }

    pub fn to_user(
        event_type: EventType,
        user_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(event_type, Scope::User(user_id.into()), payload)
    }

    pub fn to_all(event_type: EventType, payload: serde_json::Value) -> Self {
        Self::new(event_type, Scope::All, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::to_room(
            EventType::LocationUpdate,
            "circle-1",
            json!({"lat": 1.5, "lng": 2.5}),
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "location_update");
        assert_eq!(value["scope"]["kind"], "room");
        assert_eq!(value["scope"]["id"], "circle-1");
        assert_eq!(value["payload"]["lat"], 1.5);
    }

    #[test]
    fn test_broadcast_scope_has_no_id() {
        let envelope = Envelope::to_all(EventType::Notification, json!({}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["scope"], json!({"kind": "all"}));
    }

    #[test]
    fn test_only_emergency_is_critical() {
        assert!(EventType::EmergencyAlert.is_critical());
        assert!(!EventType::ChatMessage.is_critical());
        assert!(!EventType::LocationUpdate.is_critical());
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(
            EventType::TypingIndicator.default_policy(),
            BackpressurePolicy::DropOldest
        );
        assert_eq!(
            EventType::ChatMessage.default_policy(),
            BackpressurePolicy::DropNewest
        );
        assert_eq!(
            EventType::EmergencyAlert.default_policy(),
            BackpressurePolicy::ProbeAndEvict
        );
    }
}
