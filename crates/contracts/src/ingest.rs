use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::INGEST_SCHEMA_VERSION;
use crate::error::ContractError;
use crate::scalar::{NonEmptyString, Timestamp};
use crate::types::{PolicyTier, SourceChannel, SourceProvider};

/// Source identity block of an ingest envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSource {
    pub channel: SourceChannel,
    pub provider: SourceProvider,
    pub endpoint_identity: NonEmptyString,
}

/// Provider event metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestEvent {
    pub external_event_id: NonEmptyString,
    #[serde(default)]
    pub external_thread_id: Option<NonEmptyString>,
    pub observed_at: Timestamp,
}

/// Sender identity block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestSender {
    pub identity: NonEmptyString,
}

/// Raw and normalized payload content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestPayload {
    pub raw: serde_json::Map<String, Value>,
    pub normalized_text: NonEmptyString,
}

/// Optional control metadata: idempotency, tracing, scheduling tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestControl {
    #[serde(default)]
    pub idempotency_key: Option<NonEmptyString>,
    #[serde(default)]
    pub trace_context: serde_json::Map<String, Value>,
    #[serde(default)]
    pub policy_tier: PolicyTier,
}

/// Canonical versioned ingest envelope (`ingest.v1`).
///
/// Frozen after [`parse_ingest`] succeeds: the struct exposes no mutation and
/// downstream code treats it as the authoritative record of what the
/// connector observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestEnvelope {
    pub schema_version: String,
    pub source: IngestSource,
    pub event: IngestEvent,
    pub sender: IngestSender,
    pub payload: IngestPayload,
    #[serde(default)]
    pub control: IngestControl,
}

/// Parse and validate an `ingest.v1` envelope.
///
/// Validation order: exact schema version, strict-schema deserialization,
/// then the channel/provider compatibility table.
pub fn parse_ingest(payload: &Value) -> Result<IngestEnvelope, ContractError> {
    check_schema_version(payload, INGEST_SCHEMA_VERSION)?;

    let envelope: IngestEnvelope =
        serde_json::from_value(payload.clone()).map_err(|e| ContractError::from_serde(&e))?;

    let allowed = envelope.source.channel.allowed_providers();
    if !allowed.contains(&envelope.source.provider) {
        return Err(ContractError::InvalidSourceProvider {
            provider: envelope.source.provider.to_string(),
            channel: envelope.source.channel.to_string(),
        });
    }

    Ok(envelope)
}

/// Verify the `schema_version` field of `payload` is exactly `expected`.
pub(crate) fn check_schema_version(
    payload: &Value,
    expected: &'static str,
) -> Result<(), ContractError> {
    let received = payload
        .get("schema_version")
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| ContractError::FieldMissing {
            detail: "schema_version".into(),
        })?;
    if received != expected {
        return Err(ContractError::UnsupportedSchemaVersion {
            received: received.to_owned(),
            expected,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "schema_version": "ingest.v1",
            "source": {
                "channel": "email",
                "provider": "imap",
                "endpoint_identity": "inbox@example.com"
            },
            "event": {
                "external_event_id": "msg-123",
                "external_thread_id": "thread-9",
                "observed_at": "2026-02-18T10:00:00Z"
            },
            "sender": {"identity": "alerts@chase.com"},
            "payload": {
                "raw": {"headers": {"Subject": "statement"}},
                "normalized_text": "Your statement is ready."
            },
            "control": {
                "idempotency_key": "k-1",
                "trace_context": {},
                "policy_tier": "interactive"
            }
        })
    }

    #[test]
    fn parses_valid_envelope() {
        let envelope = parse_ingest(&sample()).unwrap();
        assert_eq!(envelope.source.channel, SourceChannel::Email);
        assert_eq!(envelope.sender.identity.as_str(), "alerts@chase.com");
        assert_eq!(envelope.control.policy_tier, PolicyTier::Interactive);
    }

    #[test]
    fn control_block_is_optional() {
        let mut payload = sample();
        payload.as_object_mut().unwrap().remove("control");
        let envelope = parse_ingest(&payload).unwrap();
        assert_eq!(envelope.control.policy_tier, PolicyTier::Default);
        assert!(envelope.control.idempotency_key.is_none());
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let mut payload = sample();
        payload["schema_version"] = json!("ingest.v2");
        let err = parse_ingest(&payload).unwrap_err();
        assert_eq!(err.code(), "unsupported_schema_version");
    }

    #[test]
    fn rejects_channel_provider_mismatch() {
        let mut payload = sample();
        payload["source"]["provider"] = json!("telegram");
        let err = parse_ingest(&payload).unwrap_err();
        assert_eq!(err.code(), "invalid_source_provider");
    }

    #[test]
    fn rejects_integer_epoch_timestamp() {
        let mut payload = sample();
        payload["event"]["observed_at"] = json!(1708250400);
        let err = parse_ingest(&payload).unwrap_err();
        assert_eq!(err.code(), "rfc3339_string_required");
    }

    #[test]
    fn rejects_naive_timestamp() {
        let mut payload = sample();
        payload["event"]["observed_at"] = json!("2026-02-18T10:00:00");
        let err = parse_ingest(&payload).unwrap_err();
        assert_eq!(err.code(), "timezone_required");
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut payload = sample();
        payload["source"]["extra"] = json!("nope");
        let err = parse_ingest(&payload).unwrap_err();
        assert_eq!(err.code(), "malformed_envelope");
    }

    #[test]
    fn rejects_empty_sender_identity() {
        let mut payload = sample();
        payload["sender"]["identity"] = json!("   ");
        let err = parse_ingest(&payload).unwrap_err();
        assert_eq!(err.code(), "field_missing");
    }

    #[test]
    fn serde_roundtrip_preserves_envelope() {
        let envelope = parse_ingest(&sample()).unwrap();
        let serialized = serde_json::to_value(&envelope).unwrap();
        let reparsed = parse_ingest(&serialized).unwrap();
        assert_eq!(envelope, reparsed);
    }
}
