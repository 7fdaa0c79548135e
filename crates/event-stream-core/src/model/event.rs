// File: src/model/event.rs
//
// The immutable event record stored in every stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Event type that closes a stream. Once this event is the tail of a
/// stream no further appends are accepted; continuation happens on a
/// new stream referenced from the document's terminated-streams list.
pub const EVENT_STREAM_CLOSED: &str = "EventStream.Closed";

/// Default schema version stamped on newly created events
pub const DEFAULT_EVENT_SCHEMA_VERSION: &str = "1.0.0";

/// An immutable event in a stream.
///
/// `event_version` is assigned by the caller, monotonically increasing
/// per stream and starting at 0. Once written, the only permitted
/// mutation is the compensating delete of a half-committed tail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_version: i64,
    pub event_type: String,
    pub schema_version: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub fn new(event_version: i64, event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_version,
            event_type: event_type.into(),
            schema_version: DEFAULT_EVENT_SCHEMA_VERSION.to_string(),
            payload,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// The closure marker event for a stream
    pub fn stream_closed(event_version: i64, reason: impl Into<String>) -> Self {
        let mut event = Self::new(
            event_version,
            EVENT_STREAM_CLOSED,
            serde_json::json!({ "reason": reason.into() }),
        );
        event
            .metadata
            .insert("closure".to_string(), "true".to_string());
        event
    }

    pub fn with_schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this event closes its stream
    pub fn is_stream_closure(&self) -> bool {
        self.event_type == EVENT_STREAM_CLOSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_camel_case_fields() {
        let event = Event::new(0, "Created", json!({"x": 1}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventVersion"], 0);
        assert_eq!(value["eventType"], "Created");
        assert!(value.get("schemaVersion").is_some());
    }

    #[test]
    fn closure_event_is_detected() {
        let event = Event::stream_closed(5, "migrated");
        assert!(event.is_stream_closure());
        assert_eq!(event.event_version, 5);
    }

    #[test]
    fn metadata_defaults_to_empty_on_deserialize() {
        let raw = json!({
            "eventVersion": 3,
            "eventType": "Updated",
            "schemaVersion": "1.0.0",
            "payload": {"a": true},
            "timestamp": "2024-01-01T00:00:00Z"
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert!(event.metadata.is_empty());
    }
}
