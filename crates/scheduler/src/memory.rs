use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::store::{ScheduleError, ScheduleStore};
use crate::task::ScheduledTask;

/// In-memory [`ScheduleStore`] for tests and development.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    tasks: DashMap<Uuid, ScheduledTask>,
}

impl MemoryScheduleStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, task: ScheduledTask) -> Result<Uuid, ScheduleError> {
        if self.tasks.iter().any(|t| t.name == task.name) {
            return Err(ScheduleError::DuplicateName(task.name));
        }
        let id = task.id;
        self.tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledTask>, ScheduleError> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>, ScheduleError> {
        Ok(self
            .tasks
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.clone()))
    }

    async fn list(&self) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tasks)
    }

    async fn save(&self, task: &ScheduledTask) -> Result<(), ScheduleError> {
        if !self.tasks.contains_key(&task.id) {
            return Err(ScheduleError::NotFound(task.id));
        }
        let mut updated = task.clone();
        updated.updated_at = Utc::now();
        self.tasks.insert(task.id, updated);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ScheduleError> {
        self.tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(ScheduleError::NotFound(id))
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let mut due: Vec<ScheduledTask> = self
            .tasks
            .iter()
            .filter(|t| t.enabled && t.next_run_at.is_some_and(|at| at <= now))
            .map(|t| t.clone())
            .collect();
        due.sort_by_key(|t| t.next_run_at);
        Ok(due)
    }

    async fn record_run(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: DateTime<Utc>,
        last_result: Option<Value>,
    ) -> Result<(), ScheduleError> {
        let mut task = self.tasks.get_mut(&id).ok_or(ScheduleError::NotFound(id))?;
        task.next_run_at = next_run_at;
        task.last_run_at = Some(last_run_at);
        task.last_result = last_result;
        task.updated_at = Utc::now();
        Ok(())
    }
}
