use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use crate::cron::next_run_from_now;
use crate::store::{ScheduleError, ScheduleStore};
use crate::task::{ScheduleUpdate, ScheduledTask, TaskSource};

/// One `[[butler.schedule]]` entry from the butler's TOML config.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TomlScheduleEntry {
    pub name: String,
    pub cron: String,
    pub prompt: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// What a due task asks the dispatcher to do.
#[derive(Debug, Clone)]
pub enum TaskInvocation {
    /// Send a prompt to the spawner.
    Prompt(String),
    /// Run a named background job.
    Job { name: String, args: Value },
}

/// Cron scheduler over a [`ScheduleStore`].
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
}

impl Scheduler {
    /// Build a scheduler over the given store.
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Reconcile TOML `[[butler.schedule]]` entries with the store.
    ///
    /// Inserts new entries, updates changed ones (cron, prompt, or a
    /// re-enable), and disables TOML tasks no longer present in config.
    /// Matching key is `name`; TOML tasks are never deleted.
    pub async fn sync_schedules(
        &self,
        entries: &[TomlScheduleEntry],
    ) -> Result<(), ScheduleError> {
        let existing: Vec<ScheduledTask> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|t| t.source == TaskSource::Toml)
            .collect();

        for entry in entries {
            let next_run_at = next_run_from_now(&entry.cron, entry.timezone.as_deref())?;
            match existing.iter().find(|t| t.name == entry.name) {
                Some(current) => {
                    let changed = current.cron != entry.cron
                        || current.prompt.as_deref() != Some(entry.prompt.as_str())
                        || current.timezone != entry.timezone
                        || !current.enabled;
                    if changed {
                        let mut task = current.clone();
                        task.cron = entry.cron.clone();
                        task.prompt = Some(entry.prompt.clone());
                        task.timezone = entry.timezone.clone();
                        task.enabled = true;
                        task.next_run_at = next_run_at;
                        self.store.save(&task).await?;
                        info!(name = %entry.name, "updated TOML schedule");
                    }
                }
                None => {
                    let now = Utc::now();
                    let task = ScheduledTask {
                        id: Uuid::now_v7(),
                        name: entry.name.clone(),
                        cron: entry.cron.clone(),
                        prompt: Some(entry.prompt.clone()),
                        job_name: None,
                        job_args: None,
                        source: TaskSource::Toml,
                        enabled: true,
                        next_run_at,
                        last_run_at: None,
                        last_result: None,
                        timezone: entry.timezone.clone(),
                        start_at: None,
                        end_at: None,
                        until_at: None,
                        display_title: None,
                        calendar_event_id: None,
                        created_at: now,
                        updated_at: now,
                    };
                    self.store.insert(task).await?;
                    info!(name = %entry.name, "inserted TOML schedule");
                }
            }
        }

        // Disable TOML tasks removed from config.
        for task in existing {
            if task.enabled && !entries.iter().any(|e| e.name == task.name) {
                let mut disabled = task.clone();
                disabled.enabled = false;
                disabled.next_run_at = None;
                self.store.save(&disabled).await?;
                info!(name = %task.name, "disabled removed TOML schedule");
            }
        }

        Ok(())
    }

    /// Dispatch every due task and advance its schedule.
    ///
    /// Dispatch is serial, in `next_run_at` order. The result (or error) is
    /// stored as JSON in `last_result`, and `next_run_at` always advances --
    /// a failing task never blocks its own schedule. Tasks past their
    /// end/until window are disabled instead of dispatched; tasks before
    /// `start_at` advance silently.
    ///
    /// Returns the number of tasks dispatched successfully.
    pub async fn tick<F, Fut>(&self, dispatch: F) -> Result<u32, ScheduleError>
    where
        F: Fn(TaskInvocation, String) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let span = info_span!(
            "butler.tick",
            tasks_due = tracing::field::Empty,
            tasks_run = tracing::field::Empty,
        );
        self.run_tick(dispatch, span.clone()).instrument(span).await
    }

    async fn run_tick<F, Fut>(
        &self,
        dispatch: F,
        span: tracing::Span,
    ) -> Result<u32, ScheduleError>
    where
        F: Fn(TaskInvocation, String) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let now = Utc::now();
        let due = self.store.due(now).await?;
        span.record("tasks_due", due.len());

        let mut dispatched = 0u32;
        for task in due {
            if let Some(window_end) = task.window_end()
                && now > window_end
            {
                let mut expired = task.clone();
                expired.enabled = false;
                expired.next_run_at = None;
                self.store.save(&expired).await?;
                info!(name = %task.name, "schedule window ended; task disabled");
                continue;
            }

            let next_run_at = next_run_from_now(&task.cron, task.timezone.as_deref())
                .unwrap_or_else(|e| {
                    warn!(name = %task.name, error = %e, "stored cron no longer parses");
                    None
                });

            if let Some(start_at) = task.start_at
                && now < start_at
            {
                self.store
                    .record_run(task.id, next_run_at, now, task.last_result.clone())
                    .await?;
                continue;
            }

            let invocation = match (&task.prompt, &task.job_name) {
                (Some(prompt), _) => TaskInvocation::Prompt(prompt.clone()),
                (None, Some(job)) => TaskInvocation::Job {
                    name: job.clone(),
                    args: task.job_args.clone().unwrap_or(Value::Null),
                },
                (None, None) => {
                    warn!(name = %task.name, "schedule has neither prompt nor job; skipping");
                    self.store
                        .record_run(
                            task.id,
                            next_run_at,
                            now,
                            Some(json!({"error": "schedule has neither prompt nor job"})),
                        )
                        .await?;
                    continue;
                }
            };

            let trigger_source = format!("schedule:{}", task.name);
            let last_result = match dispatch(invocation, trigger_source).await {
                Ok(result) => {
                    dispatched += 1;
                    info!(name = %task.name, "dispatched scheduled task");
                    Some(result)
                }
                Err(e) => {
                    warn!(name = %task.name, error = %e, "scheduled task dispatch failed");
                    Some(json!({"error": e}))
                }
            };

            // Advance whether or not the dispatch succeeded.
            self.store
                .record_run(task.id, next_run_at, now, last_result)
                .await?;
        }

        span.record("tasks_run", dispatched);
        Ok(dispatched)
    }

    /// Create a runtime (`source = "db"`) schedule.
    pub async fn create(
        &self,
        name: &str,
        cron: &str,
        prompt: &str,
    ) -> Result<Uuid, ScheduleError> {
        let next_run_at = next_run_from_now(cron, None)?;
        let now = Utc::now();
        let task = ScheduledTask {
            id: Uuid::now_v7(),
            name: name.to_owned(),
            cron: cron.to_owned(),
            prompt: Some(prompt.to_owned()),
            job_name: None,
            job_args: None,
            source: TaskSource::Db,
            enabled: true,
            next_run_at,
            last_run_at: None,
            last_result: None,
            timezone: None,
            start_at: None,
            end_at: None,
            until_at: None,
            display_title: None,
            calendar_event_id: None,
            created_at: now,
            updated_at: now,
        };
        let id = self.store.insert(task).await?;
        info!(name, %id, "created runtime schedule");
        Ok(id)
    }

    /// Apply a partial update.
    ///
    /// Next-run recomputation rules: enabling recomputes from the effective
    /// cron; disabling nulls `next_run_at`; a cron change recomputes unless
    /// `enabled` was set explicitly in the same update.
    pub async fn update(&self, id: Uuid, update: ScheduleUpdate) -> Result<(), ScheduleError> {
        if update.is_empty() {
            return Ok(());
        }
        let mut task = self
            .store
            .get(id)
            .await?
            .ok_or(ScheduleError::NotFound(id))?;

        if let Some(ref cron) = update.cron {
            crate::cron::validate_cron_expr(cron)?;
            task.cron = cron.clone();
        }
        if let Some(ref name) = update.name {
            if let Some(other) = self.store.get_by_name(name).await?
                && other.id != id
            {
                return Err(ScheduleError::DuplicateName(name.clone()));
            }
            task.name = name.clone();
        }
        if let Some(prompt) = update.prompt {
            task.prompt = prompt;
        }
        if let Some(job_name) = update.job_name {
            task.job_name = job_name;
        }
        if let Some(job_args) = update.job_args {
            task.job_args = job_args;
        }
        if let Some(timezone) = update.timezone {
            if let Some(ref tz) = timezone {
                crate::cron::validate_timezone(tz)?;
            }
            task.timezone = timezone;
        }
        if let Some(start_at) = update.start_at {
            task.start_at = start_at;
        }
        if let Some(end_at) = update.end_at {
            task.end_at = end_at;
        }
        if let Some(until_at) = update.until_at {
            task.until_at = until_at;
        }
        if let Some(display_title) = update.display_title {
            task.display_title = display_title;
        }
        if let Some(calendar_event_id) = update.calendar_event_id {
            task.calendar_event_id = calendar_event_id;
        }

        match update.enabled {
            Some(true) => {
                task.enabled = true;
                task.next_run_at = next_run_from_now(&task.cron, task.timezone.as_deref())?;
            }
            Some(false) => {
                task.enabled = false;
                task.next_run_at = None;
            }
            None => {
                if update.cron.is_some() {
                    task.next_run_at =
                        next_run_from_now(&task.cron, task.timezone.as_deref())?;
                }
            }
        }

        self.store.save(&task).await?;
        info!(%id, "updated schedule");
        Ok(())
    }

    /// Delete a runtime schedule. TOML-sourced tasks are refused.
    pub async fn delete(&self, id: Uuid) -> Result<(), ScheduleError> {
        let task = self
            .store
            .get(id)
            .await?
            .ok_or(ScheduleError::NotFound(id))?;
        if task.source == TaskSource::Toml {
            return Err(ScheduleError::TomlTaskImmutable);
        }
        self.store.delete(id).await?;
        info!(%id, name = %task.name, "deleted runtime schedule");
        Ok(())
    }

    /// Flip a schedule's enabled flag.
    pub async fn toggle(&self, id: Uuid, enabled: bool) -> Result<(), ScheduleError> {
        self.update(
            id,
            ScheduleUpdate {
                enabled: Some(enabled),
                ..ScheduleUpdate::default()
            },
        )
        .await
    }
}
