/// Event payloads pushed to connected users
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved event type for liveness pulses
pub const HEARTBEAT_EVENT_TYPE: &str = "heartbeat";

/// Immutable typed event.
///
/// The broker never interprets `event_type` or `payload`; the only type it
/// treats specially is [`HEARTBEAT_EVENT_TYPE`], which is never queued.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    id: Uuid,
    event_type: String,
    payload: Value,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Content-free liveness event
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_EVENT_TYPE, Value::Null)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == HEARTBEAT_EVENT_TYPE
    }

    /// Same event with its timestamp raised to at least `floor`.
    ///
    /// Used by the broker to keep per-user timestamps non-decreasing when the
    /// wall clock steps backwards.
    pub fn not_before(self, floor: DateTime<Utc>) -> Self {
        if self.timestamp >= floor {
            self
        } else {
            Self {
                timestamp: floor,
                ..self
            }
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
