use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use butlers_contracts::RouteEnvelope;

use crate::row::LifecycleState;
use crate::store::{InboxError, RouteInboxStore};

/// Re-dispatch rows that never reached a terminal state.
///
/// Runs once at daemon startup and is schedulable as a periodic task. For
/// each stuck row: an `accepted` row is first claimed via CAS (losing the
/// race means another sweep took it), a `processing` row re-enters dispatch
/// as-is -- the worker that owned it is presumed dead after the grace window.
///
/// `dispatch` receives the row id and envelope; it owns the eventual
/// `mark_processed`/`mark_errored`. A dispatch failure leaves the row in
/// `processing` so the next sweep retries it (at-least-once), and never
/// aborts the rest of the sweep.
///
/// Returns the number of rows handed to `dispatch`.
pub async fn recovery_sweep<F, Fut>(
    store: &dyn RouteInboxStore,
    dispatch: F,
    grace: Duration,
    batch: usize,
) -> Result<u32, InboxError>
where
    F: Fn(Uuid, RouteEnvelope) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let stuck = store.scan_unprocessed(grace, batch).await?;
    if stuck.is_empty() {
        return Ok(0);
    }
    info!(count = stuck.len(), "recovery sweep found stuck inbox rows");

    let mut dispatched = 0u32;
    for row in stuck {
        if row.lifecycle_state == LifecycleState::Accepted
            && !store.mark_processing(row.id).await?
        {
            // Lost the claim race; another sweeper owns this row now.
            continue;
        }

        match dispatch(row.id, row.envelope).await {
            Ok(()) => {
                dispatched += 1;
            }
            Err(e) => {
                warn!(row_id = %row.id, error = %e, "recovery dispatch failed; row stays queued");
            }
        }
    }

    Ok(dispatched)
}
