use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::HEARTBEAT_SCHEMA_VERSION;
use crate::error::ContractError;
use crate::ingest::check_schema_version;
use crate::scalar::{NonEmptyString, Timestamp};

/// Identity of the reporting connector process.
///
/// The tuple `(connector_type, endpoint_identity, instance_id)` is the
/// heartbeat key; `instance_id` is generated once per process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConnector {
    pub connector_type: NonEmptyString,
    pub endpoint_identity: NonEmptyString,
    pub instance_id: Uuid,
    #[serde(default)]
    pub version: Option<NonEmptyString>,
}

/// Self-reported connector health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatStatus {
    pub state: NonEmptyString,
    #[serde(default)]
    pub error_message: Option<String>,
    pub uptime_s: u64,
}

/// Cumulative counters since process start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatCounters {
    #[serde(default)]
    pub messages_ingested: u64,
    #[serde(default)]
    pub messages_failed: u64,
    #[serde(default)]
    pub source_api_calls: u64,
    #[serde(default)]
    pub checkpoint_saves: u64,
    #[serde(default)]
    pub dedupe_accepted: u64,
}

/// Optional ingestion checkpoint reported alongside the heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatCheckpoint {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// Canonical versioned connector heartbeat (`connector.heartbeat.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatEnvelope {
    pub schema_version: String,
    pub connector: HeartbeatConnector,
    pub status: HeartbeatStatus,
    pub counters: HeartbeatCounters,
    #[serde(default)]
    pub checkpoint: Option<HeartbeatCheckpoint>,
    pub sent_at: Timestamp,
}

/// Parse and validate a `connector.heartbeat.v1` envelope.
pub fn parse_heartbeat(payload: &Value) -> Result<HeartbeatEnvelope, ContractError> {
    check_schema_version(payload, HEARTBEAT_SCHEMA_VERSION)?;
    serde_json::from_value(payload.clone()).map_err(|e| ContractError::from_serde(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "schema_version": "connector.heartbeat.v1",
            "connector": {
                "connector_type": "gmail",
                "endpoint_identity": "inbox@example.com",
                "instance_id": Uuid::new_v4().to_string(),
                "version": "1.4.2"
            },
            "status": {"state": "healthy", "error_message": null, "uptime_s": 360},
            "counters": {
                "messages_ingested": 42,
                "messages_failed": 1,
                "source_api_calls": 99,
                "checkpoint_saves": 12,
                "dedupe_accepted": 3
            },
            "checkpoint": {"cursor": "history-777", "updated_at": "2026-02-18T10:00:00Z"},
            "sent_at": "2026-02-18T10:02:00Z"
        })
    }

    #[test]
    fn parses_full_envelope() {
        let envelope = parse_heartbeat(&sample()).unwrap();
        assert_eq!(envelope.counters.messages_ingested, 42);
        assert_eq!(envelope.status.state.as_str(), "healthy");
        assert_eq!(
            envelope.checkpoint.unwrap().cursor.as_deref(),
            Some("history-777")
        );
    }

    #[test]
    fn checkpoint_is_optional() {
        let mut payload = sample();
        payload.as_object_mut().unwrap().remove("checkpoint");
        let envelope = parse_heartbeat(&payload).unwrap();
        assert!(envelope.checkpoint.is_none());
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let mut payload = sample();
        payload["schema_version"] = json!("connector.heartbeat.v2");
        let err = parse_heartbeat(&payload).unwrap_err();
        assert_eq!(err.code(), "unsupported_schema_version");
    }

    #[test]
    fn rejects_unknown_counter() {
        let mut payload = sample();
        payload["counters"]["surprise"] = json!(1);
        let err = parse_heartbeat(&payload).unwrap_err();
        assert_eq!(err.code(), "malformed_envelope");
    }
}
