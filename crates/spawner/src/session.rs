use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::SpawnerError;

/// Fields written when a session starts.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub prompt: String,
    pub trigger_source: String,
    pub model: Option<String>,
    pub parent_session_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub trace_id: Option<String>,
}

/// Fields written when a session reaches a terminal state.
#[derive(Debug, Clone, Default)]
pub struct SessionCompletion {
    pub result: Option<String>,
    pub tool_calls: Value,
    pub duration_ms: Option<u64>,
    pub cost: Option<Value>,
    pub success: bool,
    pub error: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// One row of the sessions table.
///
/// A session is active while `completed_at` is null; parent/child links form
/// the trace tree.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: Uuid,
    pub prompt: String,
    pub trigger_source: String,
    pub result: Option<String>,
    pub tool_calls: Value,
    pub duration_ms: Option<u64>,
    pub trace_id: Option<String>,
    pub model: Option<String>,
    pub cost: Option<Value>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub parent_session_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
}

impl SessionRow {
    /// Whether this session is still running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.completed_at.is_none()
    }
}

/// Storage for session lifecycle records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session row; returns its id. `completed_at` starts null.
    async fn create(&self, session: NewSession) -> Result<Uuid, SpawnerError>;

    /// Write the terminal fields and stamp `completed_at`.
    async fn complete(
        &self,
        session_id: Uuid,
        completion: SessionCompletion,
    ) -> Result<(), SpawnerError>;

    /// Fetch one session.
    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRow>, SpawnerError>;

    /// Every session with `completed_at` null, newest `started_at` first.
    /// This is the system's liveness view.
    async fn active(&self) -> Result<Vec<SessionRow>, SpawnerError>;
}

/// In-memory [`SessionStore`] for tests and development.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    rows: DashMap<Uuid, SessionRow>,
}

impl MemorySessionStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: NewSession) -> Result<Uuid, SpawnerError> {
        let id = Uuid::now_v7();
        self.rows.insert(
            id,
            SessionRow {
                id,
                prompt: session.prompt,
                trigger_source: session.trigger_source,
                result: None,
                tool_calls: Value::Array(Vec::new()),
                duration_ms: None,
                trace_id: session.trace_id,
                model: session.model,
                cost: None,
                success: None,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
                input_tokens: None,
                output_tokens: None,
                parent_session_id: session.parent_session_id,
                request_id: session.request_id,
            },
        );
        Ok(id)
    }

    async fn complete(
        &self,
        session_id: Uuid,
        completion: SessionCompletion,
    ) -> Result<(), SpawnerError> {
        let mut row = self
            .rows
            .get_mut(&session_id)
            .ok_or_else(|| SpawnerError::Session(format!("unknown session {session_id}")))?;
        row.result = completion.result;
        row.tool_calls = completion.tool_calls;
        row.duration_ms = completion.duration_ms;
        row.cost = completion.cost;
        row.success = Some(completion.success);
        row.error = completion.error;
        row.input_tokens = completion.input_tokens;
        row.output_tokens = completion.output_tokens;
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRow>, SpawnerError> {
        Ok(self.rows.get(&session_id).map(|r| r.clone()))
    }

    async fn active(&self) -> Result<Vec<SessionRow>, SpawnerError> {
        let mut active: Vec<SessionRow> = self
            .rows
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.clone())
            .collect();
        active.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(active)
    }
}

fn backend(e: sqlx::Error) -> SpawnerError {
    SpawnerError::Session(e.to_string())
}

/// PostgreSQL-backed [`SessionStore`] over the `sessions` table.
pub struct PostgresSessionStore {
    pool: PgPool,
    table: String,
}

impl PostgresSessionStore {
    /// Build a store on an existing pool, creating the table if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, SpawnerError> {
        let table = format!("{schema}.sessions");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                prompt TEXT NOT NULL,
                trigger_source TEXT NOT NULL,
                result TEXT,
                tool_calls JSONB NOT NULL DEFAULT '[]'::jsonb,
                duration_ms BIGINT,
                trace_id TEXT,
                model TEXT,
                cost JSONB,
                success BOOLEAN,
                error TEXT,
                started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                completed_at TIMESTAMPTZ,
                input_tokens BIGINT,
                output_tokens BIGINT,
                parent_session_id UUID,
                request_id UUID
            )"
        );
        let create_active_idx = format!(
            "CREATE INDEX IF NOT EXISTS sessions_active_idx \
             ON {table} (started_at DESC) WHERE completed_at IS NULL"
        );
        sqlx::query(&create).execute(&pool).await.map_err(backend)?;
        sqlx::query(&create_active_idx)
            .execute(&pool)
            .await
            .map_err(backend)?;
        Ok(Self { pool, table })
    }

    fn row_from_pg(row: &sqlx::postgres::PgRow) -> SessionRow {
        SessionRow {
            id: row.get("id"),
            prompt: row.get("prompt"),
            trigger_source: row.get("trigger_source"),
            result: row.get("result"),
            tool_calls: row.get("tool_calls"),
            duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|v| v as u64),
            trace_id: row.get("trace_id"),
            model: row.get("model"),
            cost: row.get("cost"),
            success: row.get("success"),
            error: row.get("error"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            input_tokens: row.get::<Option<i64>, _>("input_tokens").map(|v| v as u64),
            output_tokens: row
                .get::<Option<i64>, _>("output_tokens")
                .map(|v| v as u64),
            parent_session_id: row.get("parent_session_id"),
            request_id: row.get("request_id"),
        }
    }

    const COLUMNS: &'static str =
        "id, prompt, trigger_source, result, tool_calls, duration_ms, trace_id, model, \
         cost, success, error, started_at, completed_at, input_tokens, output_tokens, \
         parent_session_id, request_id";
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn create(&self, session: NewSession) -> Result<Uuid, SpawnerError> {
        let id = Uuid::now_v7();
        let query = format!(
            "INSERT INTO {} \
                 (id, prompt, trigger_source, model, parent_session_id, request_id, trace_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            self.table
        );
        sqlx::query(&query)
            .bind(id)
            .bind(&session.prompt)
            .bind(&session.trigger_source)
            .bind(&session.model)
            .bind(session.parent_session_id)
            .bind(session.request_id)
            .bind(&session.trace_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(id)
    }

    async fn complete(
        &self,
        session_id: Uuid,
        completion: SessionCompletion,
    ) -> Result<(), SpawnerError> {
        let query = format!(
            "UPDATE {} \
             SET result = $2, tool_calls = $3, duration_ms = $4, cost = $5, \
                 success = $6, error = $7, input_tokens = $8, output_tokens = $9, \
                 completed_at = now() \
             WHERE id = $1",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(session_id)
            .bind(&completion.result)
            .bind(&completion.tool_calls)
            .bind(completion.duration_ms.map(|v| v as i64))
            .bind(&completion.cost)
            .bind(completion.success)
            .bind(&completion.error)
            .bind(completion.input_tokens.map(|v| v as i64))
            .bind(completion.output_tokens.map(|v| v as i64))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(SpawnerError::Session(format!(
                "unknown session {session_id}"
            )));
        }
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<SessionRow>, SpawnerError> {
        let query = format!("SELECT {} FROM {} WHERE id = $1", Self::COLUMNS, self.table);
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.as_ref().map(Self::row_from_pg))
    }

    async fn active(&self) -> Result<Vec<SessionRow>, SpawnerError> {
        let query = format!(
            "SELECT {} FROM {} WHERE completed_at IS NULL ORDER BY started_at DESC",
            Self::COLUMNS,
            self.table
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().map(Self::row_from_pg).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn active_sessions_are_newest_first() {
        let store = MemorySessionStore::new();
        let first = store
            .create(NewSession {
                prompt: "one".into(),
                trigger_source: "test".into(),
                model: None,
                parent_session_id: None,
                request_id: None,
                trace_id: None,
            })
            .await
            .unwrap();
        let second = store
            .create(NewSession {
                prompt: "two".into(),
                trigger_source: "test".into(),
                model: None,
                parent_session_id: None,
                request_id: None,
                trace_id: None,
            })
            .await
            .unwrap();

        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, second);
        assert!(active.iter().all(SessionRow::is_active));

        store
            .complete(
                second,
                SessionCompletion {
                    success: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let active = store.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first);
    }

    #[tokio::test]
    async fn completion_is_recorded() {
        let store = MemorySessionStore::new();
        let id = store
            .create(NewSession {
                prompt: "p".into(),
                trigger_source: "schedule:checkup".into(),
                model: Some("gemini-2.0".into()),
                parent_session_id: None,
                request_id: None,
                trace_id: Some("trace-1".into()),
            })
            .await
            .unwrap();

        store
            .complete(
                id,
                SessionCompletion {
                    result: Some("done".into()),
                    tool_calls: serde_json::json!([{"name": "mailbox_post"}]),
                    duration_ms: Some(1200),
                    success: true,
                    input_tokens: Some(100),
                    output_tokens: Some(20),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let row = store.get(id).await.unwrap().unwrap();
        assert!(!row.is_active());
        assert_eq!(row.result.as_deref(), Some("done"));
        assert_eq!(row.success, Some(true));
        assert_eq!(row.duration_ms, Some(1200));
        assert_eq!(row.trigger_source, "schedule:checkup");
    }
}
