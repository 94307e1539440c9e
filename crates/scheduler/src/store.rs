use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::task::ScheduledTask;

/// Errors from scheduling operations.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule not found: {0}")]
    NotFound(Uuid),

    #[error("invalid cron expression: {0}")]
    CronInvalid(String),

    #[error("schedule name already exists: {0}")]
    DuplicateName(String),

    #[error("TOML-sourced schedule cannot be deleted; disable it instead")]
    TomlTaskImmutable,

    #[error("backend error: {0}")]
    Backend(String),
}

impl ScheduleError {
    /// Stable code string for tool responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "schedule_not_found",
            Self::CronInvalid(_) => "cron_invalid",
            Self::DuplicateName(_) => "schedule_name_taken",
            Self::TomlTaskImmutable => "schedule_toml_immutable",
            Self::Backend(_) => "backend_error",
        }
    }
}

/// Storage for scheduled tasks.
///
/// The scheduler computes every state change; stores only persist rows and
/// answer the due-task query.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a task. Fails with [`ScheduleError::DuplicateName`] when the
    /// name is taken.
    async fn insert(&self, task: ScheduledTask) -> Result<Uuid, ScheduleError>;

    /// Fetch one task by id.
    async fn get(&self, id: Uuid) -> Result<Option<ScheduledTask>, ScheduleError>;

    /// Fetch one task by its unique name.
    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>, ScheduleError>;

    /// All tasks, ordered by name.
    async fn list(&self) -> Result<Vec<ScheduledTask>, ScheduleError>;

    /// Persist the mutable fields of `task` (matched by id).
    async fn save(&self, task: &ScheduledTask) -> Result<(), ScheduleError>;

    /// Delete a task row. The TOML-immutability rule is enforced above this.
    async fn delete(&self, id: Uuid) -> Result<(), ScheduleError>;

    /// Enabled tasks with `next_run_at <= now`, ordered by `next_run_at`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, ScheduleError>;

    /// Record one tick outcome: the advanced `next_run_at`, the run
    /// timestamp, and the result (or error) JSON.
    async fn record_run(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: DateTime<Utc>,
        last_result: Option<Value>,
    ) -> Result<(), ScheduleError>;
}
