// File: src/model/snapshot.rs
//
// Versioned aggregate snapshots, addressed by (stream, version, name).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time materialization of an aggregate at a stream version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub stream_id: String,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub aggregate_type: String,
    pub data: serde_json::Value,
    pub created_timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(
        stream_id: impl Into<String>,
        version: i64,
        aggregate_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            name: None,
            aggregate_type: aggregate_type.into(),
            data,
            created_timestamp: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Key suffix shared by both substrates:
    /// `{version:020}` plus the optional `_name` qualifier.
    pub fn key_suffix(version: i64, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{:020}_{}", version, name),
            None => format!("{:020}", version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_suffix_zero_pads_to_twenty_digits() {
        assert_eq!(Snapshot::key_suffix(42, None), "00000000000000000042");
        assert_eq!(
            Snapshot::key_suffix(42, Some("audit")),
            "00000000000000000042_audit"
        );
    }

    #[test]
    fn name_is_omitted_from_serialization_when_absent() {
        let snapshot = Snapshot::new("abc-0000000000", 3, "Item", json!({"count": 3}));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("name").is_none());
        assert_eq!(value["version"], 3);
    }
}
