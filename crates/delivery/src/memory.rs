use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{DeliveryError, ErrorClass};
use crate::request::{
    AttemptOutcome, DeadLetterFilter, DeadLetterPage, DeadLetterRecord, DeliveryAttempt,
    DeliveryReceipt, DeliveryRequestRow, DeliveryStatus, DeliverySubmit, ReplayOutcome,
    SubmitOutcome, replay_idempotency_key,
};
use crate::store::DeliveryStore;

#[derive(Debug, Default)]
struct Tables {
    requests: HashMap<Uuid, DeliveryRequestRow>,
    by_idempotency_key: HashMap<String, Uuid>,
    attempts: HashMap<Uuid, Vec<DeliveryAttempt>>,
    receipts: HashMap<Uuid, DeliveryReceipt>,
    dead_letters: HashMap<Uuid, DeadLetterRecord>,
    /// delivery_request_id → dead_letter_id (one per request).
    dead_letter_by_request: HashMap<Uuid, Uuid>,
}

/// In-memory [`DeliveryStore`] for tests and development.
///
/// A single mutex stands in for the row locks the Postgres backend takes,
/// which makes replay/discard check-and-mutate trivially serial.
#[derive(Debug, Default)]
pub struct MemoryDeliveryStore {
    tables: Mutex<Tables>,
}

impl MemoryDeliveryStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded receipt for a delivery, if any.
    #[must_use]
    pub fn receipt(&self, delivery_id: Uuid) -> Option<DeliveryReceipt> {
        self.tables
            .lock()
            .expect("delivery tables mutex poisoned")
            .receipts
            .get(&delivery_id)
            .cloned()
    }
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn submit(&self, submit: DeliverySubmit) -> Result<SubmitOutcome, DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        if let Some(existing) = tables.by_idempotency_key.get(&submit.idempotency_key) {
            return Ok(SubmitOutcome {
                delivery_id: *existing,
                duplicate: true,
            });
        }

        let id = Uuid::now_v7();
        tables
            .by_idempotency_key
            .insert(submit.idempotency_key.clone(), id);
        tables.requests.insert(
            id,
            DeliveryRequestRow {
                id,
                idempotency_key: submit.idempotency_key,
                request_id: submit.request_id,
                origin_butler: submit.origin_butler,
                channel: submit.channel,
                intent: submit.intent,
                target_identity: submit.target_identity,
                message_content: submit.message_content,
                subject: submit.subject,
                request_envelope: submit.request_envelope,
                status: DeliveryStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
            },
        );
        Ok(SubmitOutcome {
            delivery_id: id,
            duplicate: false,
        })
    }

    async fn get_request(
        &self,
        delivery_id: Uuid,
    ) -> Result<Option<DeliveryRequestRow>, DeliveryError> {
        Ok(self
            .tables
            .lock()
            .expect("delivery tables mutex poisoned")
            .requests
            .get(&delivery_id)
            .cloned())
    }

    async fn set_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        let row = tables
            .requests
            .get_mut(&delivery_id)
            .ok_or(DeliveryError::RequestNotFound(delivery_id))?;
        row.status = status;
        if matches!(status, DeliveryStatus::Delivered | DeliveryStatus::DeadLettered) {
            row.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn begin_attempt(&self, delivery_id: Uuid) -> Result<u32, DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        if !tables.requests.contains_key(&delivery_id) {
            return Err(DeliveryError::RequestNotFound(delivery_id));
        }
        let attempts = tables.attempts.entry(delivery_id).or_default();
        let attempt_number = attempts.len() as u32 + 1;
        attempts.push(DeliveryAttempt {
            delivery_request_id: delivery_id,
            attempt_number,
            outcome: AttemptOutcome::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error_class: None,
            error_detail: None,
        });
        Ok(attempt_number)
    }

    async fn finish_attempt(
        &self,
        delivery_id: Uuid,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error_class: Option<ErrorClass>,
        error_detail: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        let attempt = tables
            .attempts
            .get_mut(&delivery_id)
            .and_then(|attempts| {
                attempts
                    .iter_mut()
                    .find(|a| a.attempt_number == attempt_number)
            })
            .ok_or(DeliveryError::RequestNotFound(delivery_id))?;
        attempt.outcome = outcome;
        attempt.completed_at = Some(Utc::now());
        attempt.error_class = error_class;
        attempt.error_detail = error_detail.map(str::to_owned);
        Ok(())
    }

    async fn attempts(&self, delivery_id: Uuid) -> Result<Vec<DeliveryAttempt>, DeliveryError> {
        Ok(self
            .tables
            .lock()
            .expect("delivery tables mutex poisoned")
            .attempts
            .get(&delivery_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_receipt(
        &self,
        delivery_id: Uuid,
        provider_id: &str,
        raw: Value,
    ) -> Result<(), DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        if !tables.requests.contains_key(&delivery_id) {
            return Err(DeliveryError::RequestNotFound(delivery_id));
        }
        tables.receipts.insert(
            delivery_id,
            DeliveryReceipt {
                delivery_request_id: delivery_id,
                provider_id: provider_id.to_owned(),
                raw,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery_id: Uuid,
        quarantine_reason: &str,
        error_class: ErrorClass,
        error_summary: &str,
    ) -> Result<Uuid, DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        let request = tables
            .requests
            .get(&delivery_id)
            .ok_or(DeliveryError::RequestNotFound(delivery_id))?
            .clone();
        if let Some(existing) = tables.dead_letter_by_request.get(&delivery_id) {
            return Ok(*existing);
        }

        let attempts = tables.attempts.get(&delivery_id).cloned().unwrap_or_default();
        let outcomes: Vec<Value> = attempts
            .iter()
            .map(|a| {
                json!({
                    "attempt_number": a.attempt_number,
                    "outcome": a.outcome.as_str(),
                    "error_class": a.error_class.map(ErrorClass::as_str),
                    "error_detail": a.error_detail,
                })
            })
            .collect();

        let id = Uuid::now_v7();
        tables.dead_letters.insert(
            id,
            DeadLetterRecord {
                id,
                delivery_request_id: delivery_id,
                origin_butler: request.origin_butler.clone(),
                channel: request.channel.clone(),
                intent: request.intent.clone(),
                target_identity: request.target_identity.clone(),
                idempotency_key: request.idempotency_key.clone(),
                quarantine_reason: quarantine_reason.to_owned(),
                error_class,
                error_summary: error_summary.to_owned(),
                total_attempts: attempts.len() as u32,
                first_attempt_at: attempts.first().map(|a| a.started_at),
                last_attempt_at: attempts.last().map(|a| a.started_at),
                original_request_envelope: request.request_envelope.clone(),
                all_attempt_outcomes: Value::Array(outcomes),
                replay_eligible: error_class.default_replay_eligible(),
                replay_count: 0,
                discarded_at: None,
                discard_reason: None,
                created_at: Utc::now(),
            },
        );
        tables.dead_letter_by_request.insert(delivery_id, id);
        Ok(id)
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<DeadLetterPage, DeliveryError> {
        let limit = filter.effective_limit();
        let tables = self.tables.lock().expect("delivery tables mutex poisoned");
        let mut matching: Vec<DeadLetterRecord> = tables
            .dead_letters
            .values()
            .filter(|dl| filter.include_discarded || dl.discarded_at.is_none())
            .filter(|dl| filter.channel.as_deref().is_none_or(|c| dl.channel == c))
            .filter(|dl| {
                filter
                    .origin_butler
                    .as_deref()
                    .is_none_or(|o| dl.origin_butler == o)
            })
            .filter(|dl| filter.error_class.is_none_or(|ec| dl.error_class == ec))
            .filter(|dl| filter.since.is_none_or(|since| dl.created_at >= since))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(limit);
        Ok(DeadLetterPage {
            count: matching.len(),
            dead_letters: matching,
            limit,
        })
    }

    async fn inspect_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<Option<DeadLetterRecord>, DeliveryError> {
        Ok(self
            .tables
            .lock()
            .expect("delivery tables mutex poisoned")
            .dead_letters
            .get(&dead_letter_id)
            .cloned())
    }

    async fn replay_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<ReplayOutcome, DeliveryError> {
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        let dead_letter = tables
            .dead_letters
            .get(&dead_letter_id)
            .ok_or(DeliveryError::DeadLetterNotFound(dead_letter_id))?
            .clone();

        if let Some(discarded_at) = dead_letter.discarded_at {
            return Err(DeliveryError::AlreadyDiscarded {
                id: dead_letter_id,
                discarded_at,
            });
        }
        if !dead_letter.replay_eligible {
            return Err(DeliveryError::NotReplayEligible {
                id: dead_letter_id,
                reason: "replay_eligible is false".into(),
            });
        }

        let original = tables
            .requests
            .get(&dead_letter.delivery_request_id)
            .ok_or(DeliveryError::RequestNotFound(dead_letter.delivery_request_id))?
            .clone();

        let replay_number = dead_letter.replay_count + 1;
        let new_key = replay_idempotency_key(&original.idempotency_key, replay_number);
        let new_id = Uuid::now_v7();
        tables.by_idempotency_key.insert(new_key.clone(), new_id);
        tables.requests.insert(
            new_id,
            DeliveryRequestRow {
                id: new_id,
                idempotency_key: new_key.clone(),
                status: DeliveryStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
                ..original
            },
        );
        if let Some(dl) = tables.dead_letters.get_mut(&dead_letter_id) {
            dl.replay_count = replay_number;
        }

        Ok(ReplayOutcome {
            replayed_delivery_id: new_id,
            original_dead_letter_id: dead_letter_id,
            replay_number,
            new_idempotency_key: new_key,
        })
    }

    async fn discard_dead_letter(
        &self,
        dead_letter_id: Uuid,
        reason: &str,
    ) -> Result<(), DeliveryError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DeliveryError::EmptyDiscardReason);
        }
        let mut tables = self.tables.lock().expect("delivery tables mutex poisoned");
        let dead_letter = tables
            .dead_letters
            .get_mut(&dead_letter_id)
            .ok_or(DeliveryError::DeadLetterNotFound(dead_letter_id))?;
        if let Some(discarded_at) = dead_letter.discarded_at {
            return Err(DeliveryError::AlreadyDiscarded {
                id: dead_letter_id,
                discarded_at,
            });
        }
        dead_letter.discarded_at = Some(Utc::now());
        dead_letter.discard_reason = Some(reason.to_owned());
        dead_letter.replay_eligible = false;
        Ok(())
    }
}
