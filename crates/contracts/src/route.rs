use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ROUTE_SCHEMA_VERSION;
use crate::error::ContractError;
use crate::ingest::check_schema_version;
use crate::scalar::{NonEmptyString, RequestId, Timestamp};
use crate::types::{FanoutMode, SourceChannel};

/// Immutable routed request lineage.
///
/// Travels with every envelope derived from an ingested event. The five core
/// fields identify the originating request forever; subrequest and segment
/// ids are appended as fan-out narrows scope, and `trace_context` carries
/// W3C trace headers across process boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub received_at: Timestamp,
    pub source_channel: SourceChannel,
    pub source_endpoint_identity: NonEmptyString,
    pub source_sender_identity: NonEmptyString,
    #[serde(default)]
    pub source_thread_identity: Option<NonEmptyString>,
    #[serde(default)]
    pub subrequest_id: Option<NonEmptyString>,
    #[serde(default)]
    pub segment_id: Option<NonEmptyString>,
    #[serde(default)]
    pub trace_context: serde_json::Map<String, Value>,
}

impl RequestContext {
    /// Validate `candidate` against a parent lineage, enforcing that the five
    /// immutable fields are unchanged.
    ///
    /// Returns the candidate on success so call sites can chain construction.
    pub fn validate_with_lineage(
        candidate: RequestContext,
        parent: &RequestContext,
    ) -> Result<RequestContext, ContractError> {
        fn frozen(field: &'static str) -> ContractError {
            ContractError::ImmutableRequestContext { field }
        }

        if candidate.request_id != parent.request_id {
            return Err(frozen("request_id"));
        }
        if candidate.received_at != parent.received_at {
            return Err(frozen("received_at"));
        }
        if candidate.source_channel != parent.source_channel {
            return Err(frozen("source_channel"));
        }
        if candidate.source_endpoint_identity != parent.source_endpoint_identity {
            return Err(frozen("source_endpoint_identity"));
        }
        if candidate.source_sender_identity != parent.source_sender_identity {
            return Err(frozen("source_sender_identity"));
        }
        Ok(candidate)
    }
}

/// Route input payload: the prompt to execute and optional context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteInput {
    pub prompt: NonEmptyString,
    #[serde(default)]
    pub context: Option<Value>,
}

/// Subrequest metadata for fanned-out routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSubrequest {
    pub subrequest_id: NonEmptyString,
    pub segment_id: NonEmptyString,
    pub fanout_mode: FanoutMode,
}

fn default_route_tool() -> NonEmptyString {
    NonEmptyString::new("route.execute").expect("literal is non-empty")
}

/// Target metadata for downstream dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteTarget {
    pub butler: NonEmptyString,
    #[serde(default = "default_route_tool")]
    pub tool: NonEmptyString,
}

/// Optional source metadata propagated during dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSourceMetadata {
    pub channel: SourceChannel,
    pub identity: NonEmptyString,
    pub tool_name: NonEmptyString,
    #[serde(default)]
    pub source_id: Option<NonEmptyString>,
}

/// Canonical versioned route envelope (`route.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEnvelope {
    pub schema_version: String,
    pub request_context: RequestContext,
    pub input: RouteInput,
    #[serde(default)]
    pub subrequest: Option<RouteSubrequest>,
    #[serde(default)]
    pub target: Option<RouteTarget>,
    #[serde(default)]
    pub source_metadata: Option<RouteSourceMetadata>,
    #[serde(default)]
    pub trace_context: serde_json::Map<String, Value>,
}

/// Parse and validate a `route.v1` envelope.
///
/// Beyond strict-schema deserialization, this enforces that the request
/// context's `subrequest_id`/`segment_id`, when present, agree with the
/// sibling `subrequest` block.
pub fn parse_route(payload: &Value) -> Result<RouteEnvelope, ContractError> {
    check_schema_version(payload, ROUTE_SCHEMA_VERSION)?;

    let envelope: RouteEnvelope =
        serde_json::from_value(payload.clone()).map_err(|e| ContractError::from_serde(&e))?;

    if let Some(ref subrequest) = envelope.subrequest {
        let context = &envelope.request_context;
        if let Some(ref ctx_sub) = context.subrequest_id
            && ctx_sub != &subrequest.subrequest_id
        {
            return Err(ContractError::LineageMismatch {
                detail: "request_context.subrequest_id must match subrequest.subrequest_id".into(),
            });
        }
        if let Some(ref ctx_seg) = context.segment_id
            && ctx_seg != &subrequest.segment_id
        {
            return Err(ContractError::LineageMismatch {
                detail: "request_context.segment_id must match subrequest.segment_id".into(),
            });
        }
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_context() -> Value {
        json!({
            "request_id": Uuid::now_v7().to_string(),
            "received_at": "2026-02-18T10:00:00Z",
            "source_channel": "telegram",
            "source_endpoint_identity": "switchboard",
            "source_sender_identity": "user-7"
        })
    }

    fn sample() -> Value {
        json!({
            "schema_version": "route.v1",
            "request_context": sample_context(),
            "input": {"prompt": "Summarize today's messages."}
        })
    }

    #[test]
    fn parses_minimal_envelope() {
        let envelope = parse_route(&sample()).unwrap();
        assert!(envelope.subrequest.is_none());
        assert!(envelope.target.is_none());
        assert_eq!(envelope.input.prompt.as_str(), "Summarize today's messages.");
    }

    #[test]
    fn target_tool_defaults_to_route_execute() {
        let mut payload = sample();
        payload["target"] = json!({"butler": "finance"});
        let envelope = parse_route(&payload).unwrap();
        assert_eq!(envelope.target.unwrap().tool.as_str(), "route.execute");
    }

    #[test]
    fn rejects_non_v7_request_id() {
        let mut payload = sample();
        payload["request_context"]["request_id"] = json!(Uuid::new_v4().to_string());
        let err = parse_route(&payload).unwrap_err();
        assert_eq!(err.code(), "uuid7_required");
    }

    #[test]
    fn rejects_subrequest_id_mismatch() {
        let mut payload = sample();
        payload["request_context"]["subrequest_id"] = json!("sub-1");
        payload["request_context"]["segment_id"] = json!("seg-1");
        payload["subrequest"] = json!({
            "subrequest_id": "sub-2",
            "segment_id": "seg-1",
            "fanout_mode": "parallel"
        });
        let err = parse_route(&payload).unwrap_err();
        assert_eq!(err.code(), "lineage_mismatch");
    }

    #[test]
    fn accepts_matching_subrequest_lineage() {
        let mut payload = sample();
        payload["request_context"]["subrequest_id"] = json!("sub-1");
        payload["request_context"]["segment_id"] = json!("seg-1");
        payload["subrequest"] = json!({
            "subrequest_id": "sub-1",
            "segment_id": "seg-1",
            "fanout_mode": "ordered"
        });
        let envelope = parse_route(&payload).unwrap();
        assert_eq!(
            envelope.subrequest.unwrap().fanout_mode,
            FanoutMode::Ordered
        );
    }

    #[test]
    fn lineage_validation_passes_unchanged_context() {
        let parent: RequestContext = serde_json::from_value(sample_context()).unwrap();
        let mut child = parent.clone();
        child.subrequest_id = NonEmptyString::new("sub-1");
        child.segment_id = NonEmptyString::new("seg-1");
        let validated = RequestContext::validate_with_lineage(child, &parent).unwrap();
        assert_eq!(validated.request_id, parent.request_id);
    }

    #[test]
    fn lineage_validation_rejects_mutated_sender() {
        let parent: RequestContext = serde_json::from_value(sample_context()).unwrap();
        let mut child = parent.clone();
        child.source_sender_identity = NonEmptyString::new("someone-else").unwrap();
        let err = RequestContext::validate_with_lineage(child, &parent).unwrap_err();
        assert_eq!(
            err,
            ContractError::ImmutableRequestContext {
                field: "source_sender_identity"
            }
        );
    }

    #[test]
    fn lineage_validation_rejects_mutated_request_id() {
        let parent: RequestContext = serde_json::from_value(sample_context()).unwrap();
        let mut child = parent.clone();
        child.request_id = RequestId::generate();
        let err = RequestContext::validate_with_lineage(child, &parent).unwrap_err();
        assert_eq!(err.code(), "immutable_request_context");
    }

    #[test]
    fn lineage_equality_tolerates_offset_spelling() {
        let parent: RequestContext = serde_json::from_value(sample_context()).unwrap();
        let mut as_value = sample_context();
        as_value["received_at"] = json!("2026-02-18T11:00:00+01:00");
        as_value["request_id"] = json!(parent.request_id.to_string());
        let child: RequestContext = serde_json::from_value(as_value).unwrap();
        assert!(RequestContext::validate_with_lineage(child, &parent).is_ok());
    }

    #[test]
    fn serde_roundtrip_preserves_envelope() {
        let mut payload = sample();
        payload["subrequest"] = json!({
            "subrequest_id": "sub-1",
            "segment_id": "seg-1",
            "fanout_mode": "conditional"
        });
        let envelope = parse_route(&payload).unwrap();
        let reparsed = parse_route(&serde_json::to_value(&envelope).unwrap()).unwrap();
        assert_eq!(envelope, reparsed);
    }
}
