use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{DeliveryError, ErrorClass};
use crate::request::{
    AttemptOutcome, DeadLetterFilter, DeadLetterPage, DeadLetterRecord, DeliveryAttempt,
    DeliveryRequestRow, DeliveryStatus, DeliverySubmit, ReplayOutcome, SubmitOutcome,
};

/// Storage for the delivery table hierarchy: requests, attempts, receipts,
/// dead letters.
///
/// Invariants every backend must hold:
/// - `idempotency_key` is globally unique; a colliding submit returns the
///   existing id with `duplicate = true` and starts nothing.
/// - `(delivery_request_id, attempt_number)` is unique; attempts are
///   append-only.
/// - At most one dead letter per delivery request.
/// - Replay and discard serialize their check-and-mutate (row locks in SQL
///   backends).
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Admit a delivery request, or return the existing one for a duplicate
    /// idempotency key.
    async fn submit(&self, submit: DeliverySubmit) -> Result<SubmitOutcome, DeliveryError>;

    /// Fetch one request.
    async fn get_request(
        &self,
        delivery_id: Uuid,
    ) -> Result<Option<DeliveryRequestRow>, DeliveryError>;

    /// Update a request's status; terminal statuses also stamp
    /// `completed_at`.
    async fn set_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), DeliveryError>;

    /// Open the next numbered attempt (`in_progress`), returning its number
    /// (1-based).
    async fn begin_attempt(&self, delivery_id: Uuid) -> Result<u32, DeliveryError>;

    /// Close an attempt with its outcome and optional error taxonomy.
    async fn finish_attempt(
        &self,
        delivery_id: Uuid,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error_class: Option<ErrorClass>,
        error_detail: Option<&str>,
    ) -> Result<(), DeliveryError>;

    /// All attempts for a request, ordered by attempt number.
    async fn attempts(&self, delivery_id: Uuid) -> Result<Vec<DeliveryAttempt>, DeliveryError>;

    /// Record the provider receipt for a successful delivery.
    async fn record_receipt(
        &self,
        delivery_id: Uuid,
        provider_id: &str,
        raw: Value,
    ) -> Result<(), DeliveryError>;

    /// Dead-letter a request: snapshot its attempts and envelope into one
    /// dead-letter row. Returns the dead-letter id.
    async fn dead_letter(
        &self,
        delivery_id: Uuid,
        quarantine_reason: &str,
        error_class: ErrorClass,
        error_summary: &str,
    ) -> Result<Uuid, DeliveryError>;

    /// List dead letters newest-first. Discarded rows are excluded unless
    /// the filter opts in; the page size is clamped (≤ 500, default 50).
    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<DeadLetterPage, DeliveryError>;

    /// Fetch one dead letter with its joined request context.
    async fn inspect_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<Option<DeadLetterRecord>, DeliveryError>;

    /// Re-admit a dead-lettered delivery under a replay-suffixed idempotency
    /// key, incrementing `replay_count`. Refuses discarded or ineligible
    /// rows. The check-and-clone is transactional.
    async fn replay_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<ReplayOutcome, DeliveryError>;

    /// Permanently discard a dead letter. The reason must be non-empty;
    /// discarding twice is an error.
    async fn discard_dead_letter(
        &self,
        dead_letter_id: Uuid,
        reason: &str,
    ) -> Result<(), DeliveryError>;
}
