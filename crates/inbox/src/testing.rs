//! Conformance suite and fixtures for route inbox backends.

use serde_json::json;
use uuid::Uuid;

use butlers_contracts::{RouteEnvelope, parse_route};

use crate::row::LifecycleState;
use crate::store::{InboxError, RouteInboxStore};

/// A minimal valid `route.v1` envelope for tests.
#[must_use]
pub fn sample_envelope() -> RouteEnvelope {
    parse_route(&json!({
        "schema_version": "route.v1",
        "request_context": {
            "request_id": Uuid::now_v7().to_string(),
            "received_at": "2026-02-18T10:00:00Z",
            "source_channel": "telegram",
            "source_endpoint_identity": "switchboard",
            "source_sender_identity": "user-7"
        },
        "input": {"prompt": "Run a health check."}
    }))
    .expect("sample envelope is valid")
}

/// Run the lifecycle conformance suite against a fresh inbox backend.
///
/// # Panics
///
/// Panics on any semantic violation; backend errors propagate as `Err`.
pub async fn run_inbox_conformance(store: &dyn RouteInboxStore) -> Result<(), InboxError> {
    let envelope = sample_envelope();

    // Insert lands in `accepted` with the envelope stored verbatim.
    let row_id = store.insert(&envelope).await?;
    let row = store.fetch(row_id).await?.expect("row exists");
    assert_eq!(row.lifecycle_state, LifecycleState::Accepted);
    assert_eq!(row.envelope, envelope);
    assert!(row.processed_at.is_none());
    assert!(row.session_id.is_none());

    // accepted → processing is CAS: only the first claim wins.
    assert!(store.mark_processing(row_id).await?);
    assert!(!store.mark_processing(row_id).await?);

    // processing → processed records the session and timestamps.
    let session_id = Uuid::now_v7();
    assert!(store.mark_processed(row_id, Some(session_id)).await?);
    let row = store.fetch(row_id).await?.expect("row exists");
    assert_eq!(row.lifecycle_state, LifecycleState::Processed);
    assert_eq!(row.session_id, Some(session_id));
    assert!(row.processed_at.is_some());

    // Terminal states are write-once: further marks are no-ops.
    assert!(!store.mark_processed(row_id, None).await?);
    assert!(!store.mark_errored(row_id, "late failure").await?);
    assert!(!store.mark_processing(row_id).await?);
    let row = store.fetch(row_id).await?.expect("row exists");
    assert_eq!(row.lifecycle_state, LifecycleState::Processed);
    assert_eq!(row.session_id, Some(session_id));
    assert!(row.error_text.is_none());

    // The errored path is terminal too.
    let failed_id = store.insert(&envelope).await?;
    assert!(store.mark_processing(failed_id).await?);
    assert!(store.mark_errored(failed_id, "adapter timeout").await?);
    let row = store.fetch(failed_id).await?.expect("row exists");
    assert_eq!(row.lifecycle_state, LifecycleState::Errored);
    assert_eq!(row.error_text.as_deref(), Some("adapter timeout"));
    assert!(!store.mark_processed(failed_id, None).await?);

    // Marking straight from accepted to processed is not a legal edge.
    let skipped_id = store.insert(&envelope).await?;
    assert!(!store.mark_processed(skipped_id, None).await?);
    assert!(!store.mark_errored(skipped_id, "nope").await?);

    // Unknown rows are an error, not a silent no-op.
    let missing = store.mark_processing(Uuid::now_v7()).await;
    assert!(matches!(missing, Err(InboxError::NotFound(_))));

    Ok(())
}
