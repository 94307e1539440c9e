use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use butlers_contracts::{RouteEnvelope, parse_route};

use crate::row::{InboxRow, LifecycleState};
use crate::store::{InboxError, RouteInboxStore};

fn backend(e: sqlx::Error) -> InboxError {
    InboxError::Backend(e.to_string())
}

/// PostgreSQL-backed [`RouteInboxStore`] over the `route_inbox` table.
///
/// The envelope column is JSONB and never updated after insert; lifecycle
/// transitions are guarded `UPDATE .. WHERE lifecycle_state = $expected`
/// statements, which is what makes them CAS.
pub struct PostgresRouteInbox {
    pool: PgPool,
    table: String,
}

impl PostgresRouteInbox {
    /// Build an inbox on an existing pool, creating the table if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, InboxError> {
        let table = format!("{schema}.route_inbox");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                route_envelope JSONB NOT NULL,
                lifecycle_state TEXT NOT NULL DEFAULT 'accepted',
                received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                processed_at TIMESTAMPTZ,
                session_id UUID,
                error_text TEXT
            )"
        );
        let create_idx = format!(
            "CREATE INDEX IF NOT EXISTS route_inbox_unprocessed_idx \
             ON {table} (received_at) \
             WHERE lifecycle_state IN ('accepted', 'processing')"
        );
        sqlx::query(&create).execute(&pool).await.map_err(backend)?;
        sqlx::query(&create_idx)
            .execute(&pool)
            .await
            .map_err(backend)?;
        Ok(Self { pool, table })
    }

    fn row_from_pg(row: &sqlx::postgres::PgRow) -> Result<InboxRow, InboxError> {
        let envelope_json: serde_json::Value = row.get("route_envelope");
        let envelope: RouteEnvelope = parse_route(&envelope_json)
            .map_err(|e| InboxError::Serialization(e.to_string()))?;
        let state: String = row.get("lifecycle_state");
        Ok(InboxRow {
            id: row.get("id"),
            envelope,
            lifecycle_state: LifecycleState::from_str(&state)
                .map_err(InboxError::Serialization)?,
            received_at: row.get::<DateTime<Utc>, _>("received_at"),
            processed_at: row.get("processed_at"),
            session_id: row.get("session_id"),
            error_text: row.get("error_text"),
        })
    }

    /// Guarded transition; returns whether a row changed. Distinguishes
    /// "lost the CAS" from "row does not exist".
    async fn transition(
        &self,
        row_id: Uuid,
        set_clause: &str,
        from: LifecycleState,
        bind_error: Option<&str>,
        bind_session: Option<Option<Uuid>>,
    ) -> Result<bool, InboxError> {
        let table = &self.table;
        let query = format!(
            "UPDATE {table} SET {set_clause} WHERE id = $1 AND lifecycle_state = $2"
        );
        let mut q = sqlx::query(&query).bind(row_id).bind(from.as_str());
        if let Some(error_text) = bind_error {
            q = q.bind(error_text);
        }
        if let Some(session_id) = bind_session {
            q = q.bind(session_id);
        }
        let result = q.execute(&self.pool).await.map_err(backend)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists_query = format!("SELECT 1 FROM {table} WHERE id = $1");
        let exists = sqlx::query(&exists_query)
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if exists.is_none() {
            return Err(InboxError::NotFound(row_id));
        }
        Ok(false)
    }
}

#[async_trait]
impl RouteInboxStore for PostgresRouteInbox {
    async fn insert(&self, envelope: &RouteEnvelope) -> Result<Uuid, InboxError> {
        let id = Uuid::now_v7();
        let envelope_json = serde_json::to_value(envelope)
            .map_err(|e| InboxError::Serialization(e.to_string()))?;
        let table = &self.table;
        let query = format!(
            "INSERT INTO {table} (id, route_envelope, lifecycle_state, received_at) \
             VALUES ($1, $2, 'accepted', now())"
        );
        sqlx::query(&query)
            .bind(id)
            .bind(&envelope_json)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(id)
    }

    async fn fetch(&self, row_id: Uuid) -> Result<Option<InboxRow>, InboxError> {
        let table = &self.table;
        let query = format!(
            "SELECT id, route_envelope, lifecycle_state, received_at, \
                    processed_at, session_id, error_text \
             FROM {table} WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::row_from_pg).transpose()
    }

    async fn mark_processing(&self, row_id: Uuid) -> Result<bool, InboxError> {
        self.transition(
            row_id,
            "lifecycle_state = 'processing'",
            LifecycleState::Accepted,
            None,
            None,
        )
        .await
    }

    async fn mark_processed(
        &self,
        row_id: Uuid,
        session_id: Option<Uuid>,
    ) -> Result<bool, InboxError> {
        self.transition(
            row_id,
            "lifecycle_state = 'processed', processed_at = now(), session_id = $3",
            LifecycleState::Processing,
            None,
            Some(session_id),
        )
        .await
    }

    async fn mark_errored(&self, row_id: Uuid, error_text: &str) -> Result<bool, InboxError> {
        self.transition(
            row_id,
            "lifecycle_state = 'errored', processed_at = now(), error_text = $3",
            LifecycleState::Processing,
            Some(error_text),
            None,
        )
        .await
    }

    async fn scan_unprocessed(
        &self,
        grace: Duration,
        batch: usize,
    ) -> Result<Vec<InboxRow>, InboxError> {
        let table = &self.table;
        let query = format!(
            "SELECT id, route_envelope, lifecycle_state, received_at, \
                    processed_at, session_id, error_text \
             FROM {table} \
             WHERE lifecycle_state IN ('accepted', 'processing') \
               AND received_at <= now() - ($1 * INTERVAL '1 second') \
             ORDER BY received_at, id \
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(grace.as_secs_f64())
            .bind(batch as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_from_pg).collect()
    }
}
