use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::{ScheduleError, ScheduleStore};
use crate::task::{ScheduledTask, TaskSource};

fn backend(e: sqlx::Error) -> ScheduleError {
    ScheduleError::Backend(e.to_string())
}

/// PostgreSQL-backed [`ScheduleStore`] over the `scheduled_tasks` table.
pub struct PostgresScheduleStore {
    pool: PgPool,
    table: String,
}

impl PostgresScheduleStore {
    /// Build a store on an existing pool, creating the table if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, ScheduleError> {
        let table = format!("{schema}.scheduled_tasks");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                cron TEXT NOT NULL,
                prompt TEXT,
                job_name TEXT,
                job_args JSONB,
                source TEXT NOT NULL DEFAULT 'db',
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                next_run_at TIMESTAMPTZ,
                last_run_at TIMESTAMPTZ,
                last_result JSONB,
                timezone TEXT,
                start_at TIMESTAMPTZ,
                end_at TIMESTAMPTZ,
                until_at TIMESTAMPTZ,
                display_title TEXT,
                calendar_event_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        let create_due_idx = format!(
            "CREATE INDEX IF NOT EXISTS scheduled_tasks_due_idx \
             ON {table} (next_run_at) WHERE enabled"
        );
        sqlx::query(&create).execute(&pool).await.map_err(backend)?;
        sqlx::query(&create_due_idx)
            .execute(&pool)
            .await
            .map_err(backend)?;
        Ok(Self { pool, table })
    }

    fn task_from_pg(row: &sqlx::postgres::PgRow) -> Result<ScheduledTask, ScheduleError> {
        let source: String = row.get("source");
        Ok(ScheduledTask {
            id: row.get("id"),
            name: row.get("name"),
            cron: row.get("cron"),
            prompt: row.get("prompt"),
            job_name: row.get("job_name"),
            job_args: row.get("job_args"),
            source: TaskSource::from_str(&source).map_err(ScheduleError::Backend)?,
            enabled: row.get("enabled"),
            next_run_at: row.get("next_run_at"),
            last_run_at: row.get("last_run_at"),
            last_result: row.get("last_result"),
            timezone: row.get("timezone"),
            start_at: row.get("start_at"),
            end_at: row.get("end_at"),
            until_at: row.get("until_at"),
            display_title: row.get("display_title"),
            calendar_event_id: row.get("calendar_event_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    const COLUMNS: &'static str =
        "id, name, cron, prompt, job_name, job_args, source, enabled, next_run_at, \
         last_run_at, last_result, timezone, start_at, end_at, until_at, display_title, \
         calendar_event_id, created_at, updated_at";
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    async fn insert(&self, task: ScheduledTask) -> Result<Uuid, ScheduleError> {
        let query = format!(
            "INSERT INTO {} \
                 (id, name, cron, prompt, job_name, job_args, source, enabled, next_run_at, \
                  timezone, start_at, end_at, until_at, display_title, calendar_event_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(task.id)
            .bind(&task.name)
            .bind(&task.cron)
            .bind(&task.prompt)
            .bind(&task.job_name)
            .bind(&task.job_args)
            .bind(task.source.as_str())
            .bind(task.enabled)
            .bind(task.next_run_at)
            .bind(&task.timezone)
            .bind(task.start_at)
            .bind(task.end_at)
            .bind(task.until_at)
            .bind(&task.display_title)
            .bind(&task.calendar_event_id)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(task.id),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(ScheduleError::DuplicateName(task.name))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledTask>, ScheduleError> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            Self::COLUMNS,
            self.table
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::task_from_pg).transpose()
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<ScheduledTask>, ScheduleError> {
        let query = format!(
            "SELECT {} FROM {} WHERE name = $1",
            Self::COLUMNS,
            self.table
        );
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::task_from_pg).transpose()
    }

    async fn list(&self) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let query = format!(
            "SELECT {} FROM {} ORDER BY name",
            Self::COLUMNS,
            self.table
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::task_from_pg).collect()
    }

    async fn save(&self, task: &ScheduledTask) -> Result<(), ScheduleError> {
        let query = format!(
            "UPDATE {} \
             SET name = $2, cron = $3, prompt = $4, job_name = $5, job_args = $6, \
                 enabled = $7, next_run_at = $8, timezone = $9, start_at = $10, \
                 end_at = $11, until_at = $12, display_title = $13, \
                 calendar_event_id = $14, updated_at = now() \
             WHERE id = $1",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(task.id)
            .bind(&task.name)
            .bind(&task.cron)
            .bind(&task.prompt)
            .bind(&task.job_name)
            .bind(&task.job_args)
            .bind(task.enabled)
            .bind(task.next_run_at)
            .bind(&task.timezone)
            .bind(task.start_at)
            .bind(task.end_at)
            .bind(task.until_at)
            .bind(&task.display_title)
            .bind(&task.calendar_event_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(ScheduleError::NotFound(task.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), ScheduleError> {
        let query = format!("DELETE FROM {} WHERE id = $1", self.table);
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(ScheduleError::NotFound(id));
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, ScheduleError> {
        let query = format!(
            "SELECT {} FROM {} \
             WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1 \
             ORDER BY next_run_at",
            Self::COLUMNS,
            self.table
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::task_from_pg).collect()
    }

    async fn record_run(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_run_at: DateTime<Utc>,
        last_result: Option<Value>,
    ) -> Result<(), ScheduleError> {
        let query = format!(
            "UPDATE {} \
             SET next_run_at = $2, last_run_at = $3, last_result = $4, updated_at = now() \
             WHERE id = $1",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(next_run_at)
            .bind(last_run_at)
            .bind(&last_result)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(ScheduleError::NotFound(id));
        }
        Ok(())
    }
}
