//! Channel topic catalog and wire envelope
//!
//! Logical topic names shared by rider, driver, and operations clients.
//! Payload shapes are JSON objects; the relay only requires the fields
//! listed in the topic catalog, extra fields pass through untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod topics {
    /// client -> relay, `{tripId}`
    pub const TRIP_JOIN: &str = "trip:join";
    /// client -> relay, `{tripId}`
    pub const TRIP_LEAVE: &str = "trip:leave";
    /// bidirectional, `{tripId, status}`
    pub const TRIP_STATUS_UPDATE: &str = "trip:status-update";
    /// relay -> clients, `{tripId, driverId}`
    pub const TRIP_ACCEPTED: &str = "trip:accepted";
    /// relay -> clients, `{tripId, reason?}`
    pub const TRIP_CANCELLED: &str = "trip:cancelled";
    /// driver -> relay, `{latitude, longitude, heading, speed, tripId?}`
    pub const DRIVER_LOCATION_UPDATE: &str = "driver:location-update";
    /// client -> relay, `{tripId, message, senderRole}`
    pub const TRIP_MESSAGE: &str = "trip:message";
    /// relay -> clients, `{tripId, message, senderRole}`
    pub const TRIP_MESSAGE_RECEIVED: &str = "trip:message-received";
    /// client -> relay, `{tripId, location, message}`
    pub const TRIP_EMERGENCY: &str = "trip:emergency";
    /// relay -> trip participants + operations broadcast
    pub const TRIP_EMERGENCY_ALERT: &str = "trip:emergency-alert";
    /// driver -> relay, `{status: online|offline}`
    pub const DRIVER_STATUS_CHANGE: &str = "driver:status-change";
    /// operations client -> relay, `{}`
    pub const ADMIN_JOIN: &str = "admin:join";
    /// relay -> operations clients, fleet-wide fan-out
    pub const OPS_BROADCAST: &str = "ops:broadcast";
    /// client -> relay, queued profile mutation replay
    pub const PROFILE_UPDATE: &str = "profile:update";
    /// client -> relay, queued rating replay
    pub const RATING_SUBMIT: &str = "rating:submit";
}

/// One frame on the channel: a topic plus an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// String field accessor for the common `{tripId: ...}` payloads.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}
