use thiserror::Error;

/// Errors produced while parsing or validating a wire envelope.
///
/// Each variant carries a stable snake_case code (see [`ContractError::code`])
/// used in logs, telemetry, and tool responses. Contract errors are terminal:
/// the envelope is rejected and the caller is expected to fix the producer,
/// not retry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContractError {
    /// The `schema_version` field did not exactly match the expected version.
    #[error("unsupported schema version '{received}'; expected '{expected}'")]
    UnsupportedSchemaVersion {
        received: String,
        expected: &'static str,
    },

    /// The source provider is not valid for the declared source channel.
    #[error("source.provider '{provider}' is not valid for source.channel '{channel}'")]
    InvalidSourceProvider { provider: String, channel: String },

    /// A timestamp was supplied without an explicit UTC offset.
    #[error("{field} must be an RFC3339 timestamp with a UTC offset")]
    TimezoneRequired { field: String },

    /// A timestamp was supplied as something other than an RFC3339 string.
    #[error("{field} must be an RFC3339 timestamp string with a UTC offset")]
    Rfc3339StringRequired { field: String },

    /// `request_context.request_id` was not a UUID version 7.
    #[error("request_context.request_id must be a valid UUIDv7")]
    Uuid7Required,

    /// `request_context` subrequest fields disagree with the envelope's
    /// `subrequest` block.
    #[error("lineage mismatch: {detail}")]
    LineageMismatch { detail: String },

    /// A derived request context changed one of the five immutable lineage
    /// fields.
    #[error("request_context.{field} is immutable for routed lineage")]
    ImmutableRequestContext { field: &'static str },

    /// `delivery.intent` was `reply` or `react` but no `request_context` was
    /// supplied.
    #[error("notify.request_context is required when delivery.intent is '{intent}'")]
    MissingReplyContext { intent: String },

    /// A telegram reply or reaction was requested without a
    /// `source_thread_identity` in the request context.
    #[error("request_context.source_thread_identity is required for '{intent}' on telegram")]
    ReplyThreadRequired { intent: String },

    /// `delivery.intent` was `react` but no emoji was supplied.
    #[error("delivery.emoji is required when delivery.intent is 'react'")]
    ReactEmojiRequired,

    /// `delivery.intent` was `react` on a channel other than telegram.
    #[error("intent 'react' is not supported on channel '{channel}'; only telegram")]
    ReactChannelUnsupported { channel: String },

    /// A required field was absent or empty.
    #[error("missing or empty field: {detail}")]
    FieldMissing { detail: String },

    /// The payload did not conform to the strict envelope schema.
    #[error("malformed envelope: {detail}")]
    Malformed { detail: String },
}

impl ContractError {
    /// The stable code string for this error, suitable for telemetry labels
    /// and tool error responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedSchemaVersion { .. } => "unsupported_schema_version",
            Self::InvalidSourceProvider { .. } => "invalid_source_provider",
            Self::TimezoneRequired { .. } => "timezone_required",
            Self::Rfc3339StringRequired { .. } => "rfc3339_string_required",
            Self::Uuid7Required => "uuid7_required",
            Self::LineageMismatch { .. } => "lineage_mismatch",
            Self::ImmutableRequestContext { .. } => "immutable_request_context",
            Self::MissingReplyContext { .. } => "missing_reply_context",
            Self::ReplyThreadRequired { .. } => "reply_thread_required",
            Self::ReactEmojiRequired => "react_emoji_required",
            Self::ReactChannelUnsupported { .. } => "react_channel_unsupported",
            Self::FieldMissing { .. } => "field_missing",
            Self::Malformed { .. } => "malformed_envelope",
        }
    }

    /// Classify a serde deserialization failure into a typed contract error.
    ///
    /// Custom `Deserialize` impls in this crate embed stable marker codes in
    /// their error messages; this recovers the marker. Residual serde errors
    /// (wrong types, unknown fields) fall through to [`Self::Malformed`].
    pub(crate) fn from_serde(err: &serde_json::Error) -> Self {
        let message = err.to_string();
        if let Some(rest) = marker_payload(&message, "rfc3339_string_required") {
            return Self::Rfc3339StringRequired { field: rest };
        }
        if let Some(rest) = marker_payload(&message, "timezone_required") {
            return Self::TimezoneRequired { field: rest };
        }
        if message.contains("uuid7_required") {
            return Self::Uuid7Required;
        }
        if let Some(rest) = marker_payload(&message, "non_empty_required") {
            return Self::FieldMissing { detail: rest };
        }
        if message.contains("missing field") {
            return Self::FieldMissing { detail: message };
        }
        Self::Malformed { detail: message }
    }
}

/// Extract the payload following a `marker:` prefix in a serde error message.
fn marker_payload(message: &str, marker: &str) -> Option<String> {
    let idx = message.find(marker)?;
    let rest = &message[idx + marker.len()..];
    let rest = rest.trim_start_matches(':').trim();
    // serde appends " at line N column M" context; strip it.
    let cleaned = rest.split(" at line ").next().unwrap_or(rest);
    Some(cleaned.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ContractError::UnsupportedSchemaVersion {
                received: "ingest.v2".into(),
                expected: "ingest.v1",
            }
            .code(),
            "unsupported_schema_version"
        );
        assert_eq!(ContractError::Uuid7Required.code(), "uuid7_required");
        assert_eq!(ContractError::ReactEmojiRequired.code(), "react_emoji_required");
        assert_eq!(
            ContractError::ImmutableRequestContext { field: "request_id" }.code(),
            "immutable_request_context"
        );
    }

    #[test]
    fn marker_extraction_strips_serde_context() {
        let payload = marker_payload(
            "rfc3339_string_required: event.observed_at at line 4 column 9",
            "rfc3339_string_required",
        );
        assert_eq!(payload.as_deref(), Some("event.observed_at"));
    }
}
