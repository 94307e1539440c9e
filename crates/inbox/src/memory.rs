use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use butlers_contracts::RouteEnvelope;

use crate::row::{InboxRow, LifecycleState};
use crate::store::{InboxError, RouteInboxStore};

/// In-memory [`RouteInboxStore`] for tests and development.
#[derive(Debug, Default)]
pub struct MemoryRouteInbox {
    rows: DashMap<Uuid, InboxRow>,
}

impl MemoryRouteInbox {
    /// Create a new, empty inbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row whose `received_at` is backdated by `age`, for
    /// exercising grace-window behavior.
    pub async fn insert_aged(&self, envelope: &RouteEnvelope, age: Duration) -> Uuid {
        let id = Uuid::now_v7();
        self.rows.insert(
            id,
            InboxRow {
                id,
                envelope: envelope.clone(),
                lifecycle_state: LifecycleState::Accepted,
                received_at: Utc::now()
                    - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero()),
                processed_at: None,
                session_id: None,
                error_text: None,
            },
        );
        id
    }

    fn transition(
        &self,
        row_id: Uuid,
        from: LifecycleState,
        apply: impl FnOnce(&mut InboxRow),
    ) -> Result<bool, InboxError> {
        let Some(mut row) = self.rows.get_mut(&row_id) else {
            return Err(InboxError::NotFound(row_id));
        };
        if row.lifecycle_state != from {
            return Ok(false);
        }
        apply(&mut row);
        Ok(true)
    }
}

#[async_trait]
impl RouteInboxStore for MemoryRouteInbox {
    async fn insert(&self, envelope: &RouteEnvelope) -> Result<Uuid, InboxError> {
        Ok(self.insert_aged(envelope, Duration::ZERO).await)
    }

    async fn fetch(&self, row_id: Uuid) -> Result<Option<InboxRow>, InboxError> {
        Ok(self.rows.get(&row_id).map(|r| r.clone()))
    }

    async fn mark_processing(&self, row_id: Uuid) -> Result<bool, InboxError> {
        self.transition(row_id, LifecycleState::Accepted, |row| {
            row.lifecycle_state = LifecycleState::Processing;
        })
    }

    async fn mark_processed(
        &self,
        row_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<bool, InboxError> {
        self.transition(row_id, LifecycleState::Processing, |row| {
            row.lifecycle_state = LifecycleState::Processed;
            row.processed_at = Some(Utc::now());
            row.session_id = session_id;
        })
    }

    async fn mark_errored(&self, row_id: Uuid, error_text: &str) -> Result<bool, InboxError> {
        self.transition(row_id, LifecycleState::Processing, |row| {
            row.lifecycle_state = LifecycleState::Errored;
            row.processed_at = Some(Utc::now());
            row.error_text = Some(error_text.to_owned());
        })
    }

    async fn scan_unprocessed(
        &self,
        grace: Duration,
        batch: usize,
    ) -> Result<Vec<InboxRow>, InboxError> {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
        let mut stuck: Vec<InboxRow> = self
            .rows
            .iter()
            .filter(|r| !r.lifecycle_state.is_terminal() && r.received_at <= cutoff)
            .map(|r| r.clone())
            .collect();
        stuck.sort_by_key(|r| (r.received_at, r.id));
        stuck.truncate(batch);
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryRouteInbox::new();
        crate::testing::run_inbox_conformance(&store).await.unwrap();
    }

    #[tokio::test]
    async fn grace_window_and_batch_are_honored() {
        let store = MemoryRouteInbox::new();
        let envelope = crate::testing::sample_envelope();
        let old_a = store.insert_aged(&envelope, Duration::from_secs(120)).await;
        let old_b = store.insert_aged(&envelope, Duration::from_secs(60)).await;
        store.insert(&envelope).await.unwrap();

        let stuck = store
            .scan_unprocessed(Duration::from_secs(10), 100)
            .await
            .unwrap();
        assert_eq!(
            stuck.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![old_a, old_b]
        );

        let capped = store
            .scan_unprocessed(Duration::from_secs(10), 1)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, old_a);
    }
}
