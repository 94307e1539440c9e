use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use butlers_triage::{HistoryError, RoutingHistory};

use crate::store::RegistryError;

/// One routing attempt, recorded whether or not it succeeded.
#[derive(Debug, Clone)]
pub struct RoutingLogEntry {
    pub source_butler: String,
    pub target_butler: String,
    pub tool_name: String,
    pub success: bool,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub source_channel: Option<String>,
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RoutingLogEntry {
    /// A successful attempt.
    #[must_use]
    pub fn success(
        source_butler: impl Into<String>,
        target_butler: impl Into<String>,
        tool_name: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            source_butler: source_butler.into(),
            target_butler: target_butler.into(),
            tool_name: tool_name.into(),
            success: true,
            duration_ms: Some(duration_ms),
            error: None,
            source_channel: None,
            thread_id: None,
            created_at: Utc::now(),
        }
    }

    /// A failed attempt with its error description.
    #[must_use]
    pub fn failure(
        source_butler: impl Into<String>,
        target_butler: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            source_butler: source_butler.into(),
            target_butler: target_butler.into(),
            tool_name: tool_name.into(),
            success: false,
            duration_ms: None,
            error: Some(error.into()),
            source_channel: None,
            thread_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the originating channel and thread for affinity lookups.
    #[must_use]
    pub fn with_source(mut self, channel: Option<String>, thread_id: Option<String>) -> Self {
        self.source_channel = channel;
        self.thread_id = thread_id;
        self
    }
}

/// Append-only record of routing decisions, also queried by the
/// thread-affinity lookup.
#[async_trait]
pub trait RoutingLogStore: Send + Sync {
    /// Append one entry.
    async fn append(&self, entry: RoutingLogEntry) -> Result<(), RegistryError>;

    /// Distinct butlers this email thread routed to within the TTL window,
    /// most recent first, capped at two (the affinity lookup only
    /// distinguishes zero, one, and many).
    async fn recent_thread_targets(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<Vec<String>, RegistryError>;

    /// Whether any email routing history exists for this thread outside the
    /// TTL window.
    async fn has_stale_thread_history(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<bool, RegistryError>;
}

/// Adapter exposing a [`RoutingLogStore`] as the triage pipeline's
/// [`RoutingHistory`].
#[derive(Clone)]
pub struct AffinityHistory(pub Arc<dyn RoutingLogStore>);

#[async_trait]
impl RoutingHistory for AffinityHistory {
    async fn recent_targets(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<Vec<String>, HistoryError> {
        self.0
            .recent_thread_targets(thread_id, ttl_days)
            .await
            .map_err(|e| HistoryError(e.to_string()))
    }

    async fn has_stale_history(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<bool, HistoryError> {
        self.0
            .has_stale_thread_history(thread_id, ttl_days)
            .await
            .map_err(|e| HistoryError(e.to_string()))
    }
}
