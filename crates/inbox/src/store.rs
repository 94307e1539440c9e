use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use butlers_contracts::RouteEnvelope;

use crate::row::InboxRow;

/// Errors from route inbox operations.
#[derive(Debug, Error)]
pub enum InboxError {
    #[error("inbox row not found: {0}")]
    NotFound(Uuid),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable queue of accepted route envelopes.
///
/// Lifecycle transitions are compare-and-set on the current state, so a
/// transition returns `false` (rather than erroring) when another worker got
/// there first or the row is already terminal.
#[async_trait]
pub trait RouteInboxStore: Send + Sync {
    /// Persist an envelope atomically; the row starts in `accepted`.
    /// Returns the new row id (UUIDv7, so ids sort in insertion order).
    async fn insert(&self, envelope: &RouteEnvelope) -> Result<Uuid, InboxError>;

    /// Fetch one row by id.
    async fn fetch(&self, row_id: Uuid) -> Result<Option<InboxRow>, InboxError>;

    /// CAS `accepted → processing`. Returns whether the transition happened.
    async fn mark_processing(&self, row_id: Uuid) -> Result<bool, InboxError>;

    /// CAS `processing → processed`, recording the session that handled the
    /// row. Re-marking a processed row is a no-op returning `false`.
    async fn mark_processed(
        &self,
        row_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<bool, InboxError>;

    /// CAS `processing → errored` with a terminal error description.
    async fn mark_errored(&self, row_id: Uuid, error_text: &str) -> Result<bool, InboxError>;

    /// Rows still in `accepted` or `processing` whose `received_at` is older
    /// than `now - grace`, oldest first, capped at `batch`.
    async fn scan_unprocessed(
        &self,
        grace: Duration,
        batch: usize,
    ) -> Result<Vec<InboxRow>, InboxError>;
}
