use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::NOTIFY_SCHEMA_VERSION;
use crate::error::ContractError;
use crate::ingest::check_schema_version;
use crate::route::RequestContext;
use crate::scalar::NonEmptyString;
use crate::types::{NotifyChannel, NotifyIntent};

/// Delivery block of a notify request.
///
/// `message` is a plain string because reactions legitimately carry no text;
/// non-react intents require it to be non-empty (enforced by
/// [`parse_notify`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyDelivery {
    pub intent: NotifyIntent,
    pub channel: NotifyChannel,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub recipient: Option<NonEmptyString>,
    #[serde(default)]
    pub subject: Option<NonEmptyString>,
    #[serde(default)]
    pub emoji: Option<NonEmptyString>,
}

/// Canonical versioned notify request (`notify.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyRequest {
    pub schema_version: String,
    pub origin_butler: NonEmptyString,
    pub delivery: NotifyDelivery,
    #[serde(default)]
    pub request_context: Option<RequestContext>,
}

/// Parse and validate a `notify.v1` request.
///
/// Cross-field invariants:
/// - `reply` requires a `request_context`; on telegram it also requires
///   `source_thread_identity`.
/// - `react` requires an emoji, is only supported on telegram, and needs a
///   `request_context` carrying `source_thread_identity`.
/// - `send` and `reply` require a non-empty message; `react` may omit it.
pub fn parse_notify(payload: &Value) -> Result<NotifyRequest, ContractError> {
    check_schema_version(payload, NOTIFY_SCHEMA_VERSION)?;

    let request: NotifyRequest =
        serde_json::from_value(payload.clone()).map_err(|e| ContractError::from_serde(&e))?;

    let delivery = &request.delivery;
    match delivery.intent {
        NotifyIntent::Send | NotifyIntent::Reply => {
            if delivery.message.trim().is_empty() {
                return Err(ContractError::FieldMissing {
                    detail: "delivery.message".into(),
                });
            }
        }
        NotifyIntent::React => {}
    }

    match delivery.intent {
        NotifyIntent::Send => {}
        NotifyIntent::Reply => {
            let context = request.request_context.as_ref().ok_or_else(|| {
                ContractError::MissingReplyContext {
                    intent: "reply".into(),
                }
            })?;
            if delivery.channel == NotifyChannel::Telegram
                && context.source_thread_identity.is_none()
            {
                return Err(ContractError::ReplyThreadRequired {
                    intent: "reply".into(),
                });
            }
        }
        NotifyIntent::React => {
            if delivery.emoji.is_none() {
                return Err(ContractError::ReactEmojiRequired);
            }
            if delivery.channel != NotifyChannel::Telegram {
                return Err(ContractError::ReactChannelUnsupported {
                    channel: delivery.channel.to_string(),
                });
            }
            let context = request.request_context.as_ref().ok_or_else(|| {
                ContractError::MissingReplyContext {
                    intent: "react".into(),
                }
            })?;
            if context.source_thread_identity.is_none() {
                return Err(ContractError::ReplyThreadRequired {
                    intent: "react".into(),
                });
            }
        }
    }

    Ok(request)
}
