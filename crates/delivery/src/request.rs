use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use butlers_contracts::NotifyRequest;

use crate::error::ErrorClass;
use crate::{DEAD_LETTER_DEFAULT_LIMIT, DEAD_LETTER_MAX_LIMIT};

/// Status of a delivery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Admitted, no attempt in flight yet.
    Pending,
    /// An attempt is currently in flight.
    InFlight,
    /// Delivered; a receipt exists.
    Delivered,
    /// Out of options; a dead-letter row exists.
    DeadLettered,
}

impl DeliveryStatus {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Delivered => "delivered",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// Outcome of one numbered attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    InProgress,
    Success,
    Error,
    Deferred,
}

impl AttemptOutcome {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
            Self::Deferred => "deferred",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "deferred" => Ok(Self::Deferred),
            other => Err(format!("unknown attempt outcome: {other}")),
        }
    }
}

/// A new delivery request as submitted by a butler.
#[derive(Debug, Clone)]
pub struct DeliverySubmit {
    /// Caller-supplied, globally unique. Resubmitting the same key returns
    /// the original request.
    pub idempotency_key: String,
    /// Originating request lineage id, when the delivery replies to one.
    pub request_id: Option<Uuid>,
    pub origin_butler: String,
    pub channel: String,
    pub intent: String,
    pub target_identity: Option<String>,
    pub message_content: String,
    pub subject: Option<String>,
    /// The validated notify envelope, stored verbatim for audit and replay.
    pub request_envelope: Value,
}

impl DeliverySubmit {
    /// Build a submit from a validated `notify.v1` request.
    #[must_use]
    pub fn from_notify(request: &NotifyRequest, idempotency_key: impl Into<String>) -> Self {
        let envelope =
            serde_json::to_value(request).expect("validated notify request serializes");
        Self {
            idempotency_key: idempotency_key.into(),
            request_id: request
                .request_context
                .as_ref()
                .map(|ctx| ctx.request_id.as_uuid()),
            origin_butler: request.origin_butler.as_str().to_owned(),
            channel: request.delivery.channel.as_str().to_owned(),
            intent: request.delivery.intent.as_str().to_owned(),
            target_identity: request
                .delivery
                .recipient
                .as_ref()
                .map(|r| r.as_str().to_owned()),
            message_content: request.delivery.message.clone(),
            subject: request
                .delivery
                .subject
                .as_ref()
                .map(|s| s.as_str().to_owned()),
            request_envelope: envelope,
        }
    }
}

/// One row of `delivery_requests`. Immutable after insert except `status`
/// and terminal timestamps.
#[derive(Debug, Clone)]
pub struct DeliveryRequestRow {
    pub id: Uuid,
    pub idempotency_key: String,
    pub request_id: Option<Uuid>,
    pub origin_butler: String,
    pub channel: String,
    pub intent: String,
    pub target_identity: Option<String>,
    pub message_content: String,
    pub subject: Option<String>,
    pub request_envelope: Value,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of a submit.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub delivery_id: Uuid,
    /// True when the idempotency key already existed; no new attempt starts.
    pub duplicate: bool,
}

/// One row of `delivery_attempts`; `(delivery_request_id, attempt_number)`
/// is unique and attempts are append-only.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub delivery_request_id: Uuid,
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_class: Option<ErrorClass>,
    pub error_detail: Option<String>,
}

/// One row of `delivery_receipts`.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub delivery_request_id: Uuid,
    pub provider_id: String,
    pub raw: Value,
    pub created_at: DateTime<Utc>,
}

/// Final outcome of an engine-driven delivery.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub delivery_id: Uuid,
    pub duplicate: bool,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub provider_id: Option<String>,
    pub dead_letter_id: Option<Uuid>,
}

/// Filters for dead-letter listings.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub channel: Option<String>,
    pub origin_butler: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub include_discarded: bool,
}

impl DeadLetterFilter {
    /// Effective page size: default 50, values below 1 fall back to the
    /// default, values above 500 are clamped down.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            None => DEAD_LETTER_DEFAULT_LIMIT,
            Some(0) => DEAD_LETTER_DEFAULT_LIMIT,
            Some(n) => n.min(DEAD_LETTER_MAX_LIMIT),
        }
    }
}

/// One dead letter, joined with its delivery request context.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub delivery_request_id: Uuid,
    pub origin_butler: String,
    pub channel: String,
    pub intent: String,
    pub target_identity: Option<String>,
    pub idempotency_key: String,
    pub quarantine_reason: String,
    pub error_class: ErrorClass,
    pub error_summary: String,
    pub total_attempts: u32,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub original_request_envelope: Value,
    pub all_attempt_outcomes: Value,
    pub replay_eligible: bool,
    pub replay_count: u32,
    pub discarded_at: Option<DateTime<Utc>>,
    pub discard_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Assess whether this dead letter may be replayed right now.
    #[must_use]
    pub fn replay_assessment(&self) -> ReplayAssessment {
        let mut reasons = Vec::new();
        if !self.replay_eligible {
            reasons.push("replay_eligible flag is false".to_owned());
        }
        if let Some(at) = self.discarded_at {
            reasons.push(format!("discarded at {at}"));
        }
        ReplayAssessment {
            eligible: reasons.is_empty(),
            reasons,
            current_replay_count: self.replay_count,
        }
    }
}

/// Replay eligibility assessment attached to dead-letter inspection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReplayAssessment {
    pub eligible: bool,
    pub reasons: Vec<String>,
    pub current_replay_count: u32,
}

/// One page of dead-letter summaries.
#[derive(Debug, Clone)]
pub struct DeadLetterPage {
    pub dead_letters: Vec<DeadLetterRecord>,
    pub count: usize,
    pub limit: usize,
}

/// Result of a successful replay.
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub replayed_delivery_id: Uuid,
    pub original_dead_letter_id: Uuid,
    pub replay_number: u32,
    pub new_idempotency_key: String,
}

/// Compose the idempotency key for the `n`-th replay of `original`.
#[must_use]
pub fn replay_idempotency_key(original: &str, replay_number: u32) -> String {
    format!("{original}::replay-{replay_number}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn limit_clamping() {
        let mut filter = DeadLetterFilter::default();
        assert_eq!(filter.effective_limit(), 50);
        filter.limit = Some(0);
        assert_eq!(filter.effective_limit(), 50);
        filter.limit = Some(10);
        assert_eq!(filter.effective_limit(), 10);
        filter.limit = Some(10_000);
        assert_eq!(filter.effective_limit(), 500);
    }

    #[test]
    fn replay_keys_are_suffixed() {
        assert_eq!(replay_idempotency_key("k-1", 1), "k-1::replay-1");
        assert_eq!(replay_idempotency_key("k-1", 3), "k-1::replay-3");
    }

    #[test]
    fn submit_from_notify_extracts_fields() {
        let payload = json!({
            "schema_version": "notify.v1",
            "origin_butler": "health",
            "delivery": {
                "intent": "send",
                "channel": "telegram",
                "message": "Time for your walk",
                "recipient": "user-7"
            }
        });
        let request = butlers_contracts::parse_notify(&payload).unwrap();
        let submit = DeliverySubmit::from_notify(&request, "k-9");
        assert_eq!(submit.idempotency_key, "k-9");
        assert_eq!(submit.origin_butler, "health");
        assert_eq!(submit.channel, "telegram");
        assert_eq!(submit.intent, "send");
        assert_eq!(submit.target_identity.as_deref(), Some("user-7"));
        assert_eq!(submit.request_envelope["schema_version"], "notify.v1");
        assert!(submit.request_id.is_none());
    }

    #[test]
    fn assessment_lists_ineligibility_reasons() {
        let record = DeadLetterRecord {
            id: Uuid::now_v7(),
            delivery_request_id: Uuid::now_v7(),
            origin_butler: "health".into(),
            channel: "telegram".into(),
            intent: "send".into(),
            target_identity: None,
            idempotency_key: "k-1".into(),
            quarantine_reason: "retries exhausted".into(),
            error_class: ErrorClass::Timeout,
            error_summary: "timed out 3 times".into(),
            total_attempts: 3,
            first_attempt_at: None,
            last_attempt_at: None,
            original_request_envelope: json!({}),
            all_attempt_outcomes: json!([]),
            replay_eligible: false,
            replay_count: 2,
            discarded_at: Some(Utc::now()),
            discard_reason: Some("stale".into()),
            created_at: Utc::now(),
        };
        let assessment = record.replay_assessment();
        assert!(!assessment.eligible);
        assert_eq!(assessment.reasons.len(), 2);
        assert_eq!(assessment.current_replay_count, 2);
    }
}
