use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ------------------------------------------------------------
// Telemetry sample
// ------------------------------------------------------------
//
// One device's HostInfo as reported by a collector.
//
// The payload is intentionally opaque: collectors and the UI agree
// on its shape (OS, client version, NAT traversal details), this
// subsystem only stores and forwards it.
//
// A newer sample for the same node replaces the old one wholesale.
// Samples are never merged field by field.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TelemetrySample {
    /// Node identifier the sample belongs to
    pub node_id: String,

    /// Collector-supplied structured blob
    pub payload: Value,

    /// When this process received the sample
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            node_id: node_id.into(),
            payload,
            captured_at: Utc::now(),
        }
    }
}

// ------------------------------------------------------------
// Refresh request (pool -> remote collector)
// ------------------------------------------------------------
//
// Wire format:
//     {"NodeIDs": ["n1", "n2"]}
//
// Fire-and-forget. Answers arrive later as an unsolicited
// `{nodeID: payload}` object and are never correlated to this
// request.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    #[serde(rename = "NodeIDs")]
    pub node_ids: Vec<String>,
}

// ------------------------------------------------------------
// Persisted cache record
// ------------------------------------------------------------
//
// Disk format of one cache entry. The snapshot file is a flat JSON
// array of these records:
//
//     [{"key": "n1", "value": {...}, "expires": 1700000000000}]
//
// `expires` is an absolute Unix timestamp in milliseconds.
//
// Unknown fields are rejected so that a file written by something
// else fails validation instead of loading half-understood data.
//
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PersistedEntry<V> {
    pub key: String,
    pub value: V,
    pub expires: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn refresh_request_uses_collector_field_name() {
        let req = RefreshRequest {
            node_ids: vec!["n1".into(), "n2".into()],
        };

        let encoded = serde_json::to_value(&req).unwrap();
        assert_eq!(encoded, json!({ "NodeIDs": ["n1", "n2"] }));
    }

    #[test]
    fn persisted_entry_rejects_missing_expiry() {
        let raw = r#"{"key":"n1","value":{"OS":"linux"}}"#;
        assert!(serde_json::from_str::<PersistedEntry<Value>>(raw).is_err());
    }

    #[test]
    fn persisted_entry_rejects_unknown_fields() {
        let raw = r#"{"key":"n1","value":1,"expires":5,"extra":true}"#;
        assert!(serde_json::from_str::<PersistedEntry<Value>>(raw).is_err());
    }
}
