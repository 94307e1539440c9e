use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

/// Where a scheduled task came from.
///
/// TOML-sourced tasks are owned by config sync: they can be disabled but
/// never deleted at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    Toml,
    Db,
}

impl TaskSource {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toml => "toml",
            Self::Db => "db",
        }
    }
}

impl std::str::FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "toml" => Ok(Self::Toml),
            "db" => Ok(Self::Db),
            other => Err(format!("unknown task source: {other}")),
        }
    }
}

/// One scheduled task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub cron: String,
    /// Prompt dispatched to the spawner, for prompt-mode tasks.
    pub prompt: Option<String>,
    /// Named job and arguments, for job-mode tasks.
    pub job_name: Option<String>,
    pub job_args: Option<Value>,
    pub source: TaskSource,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<Value>,
    pub timezone: Option<String>,
    /// Do not fire before this instant.
    pub start_at: Option<DateTime<Utc>>,
    /// Stop firing at this instant; the task is disabled once passed.
    pub end_at: Option<DateTime<Utc>>,
    pub until_at: Option<DateTime<Utc>>,
    pub display_title: Option<String>,
    pub calendar_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// The instant past which this task must not fire again, if any.
    #[must_use]
    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        match (self.end_at, self.until_at) {
            (Some(end), Some(until)) => Some(end.min(until)),
            (end, until) => end.or(until),
        }
    }
}

/// Partial update for a scheduled task. `None` leaves a field untouched;
/// the double-`Option` fields distinguish "leave alone" from "set to null".
#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub prompt: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub job_name: Option<Option<String>>,
    pub job_args: Option<Option<Value>>,
    pub timezone: Option<Option<String>>,
    pub start_at: Option<Option<DateTime<Utc>>>,
    pub end_at: Option<Option<DateTime<Utc>>>,
    pub until_at: Option<Option<DateTime<Utc>>>,
    pub display_title: Option<Option<String>>,
    pub calendar_event_id: Option<Option<String>>,
}

impl ScheduleUpdate {
    /// Whether the update carries no changes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.cron.is_none()
            && self.prompt.is_none()
            && self.enabled.is_none()
            && self.job_name.is_none()
            && self.job_args.is_none()
            && self.timezone.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && self.until_at.is_none()
            && self.display_title.is_none()
            && self.calendar_event_id.is_none()
    }
}
