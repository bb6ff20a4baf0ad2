//! Event envelope
//!
//! The unit the system carries end-to-end. Wire field names are authoritative
//! for cross-replica compatibility; `data` round-trips as JSON and is carried
//! opaquely after ingress validation.

use serde::{Deserialize, Serialize};

/// Baseline event type tags; anything else must use the `custom:` namespace
pub const BASELINE_EVENT_TYPES: &[&str] = &["op", "cursor", "presence", "metric", "status"];

/// Prefix for application-defined event types
pub const CUSTOM_TYPE_PREFIX: &str = "custom:";

/// Event types eligible for coalescing: high-frequency state-overwrite events
/// where only the latest value per sender matters
pub fn is_coalescible(event_type: &str) -> bool {
    matches!(event_type, "cursor" | "presence")
}

/// A published event with its routing headers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Globally unique opaque identifier, assigned on publish
    pub id: String,
    pub topic_id: String,
    pub tenant_id: String,
    /// Publishing principal's user id (from authenticated context)
    pub sender_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Application payload; opaque to the event plane
    pub data: serde_json::Value,
    /// Per-{tenant, topic} monotonic sequence, assigned by the store at append
    pub seq: u64,
    /// ISO-8601 UTC timestamp set when the envelope is sealed; advisory
    pub ts: String,
    /// Reserved for future priority lanes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
}

impl EventEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
