use std::str::FromStr;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::{DeliveryError, ErrorClass};
use crate::request::{
    AttemptOutcome, DeadLetterFilter, DeadLetterPage, DeadLetterRecord, DeliveryAttempt,
    DeliveryRequestRow, DeliveryStatus, DeliverySubmit, ReplayOutcome, SubmitOutcome,
    replay_idempotency_key,
};
use crate::store::DeliveryStore;

fn backend(e: sqlx::Error) -> DeliveryError {
    DeliveryError::Backend(e.to_string())
}

/// PostgreSQL-backed [`DeliveryStore`] over the messenger schema's four
/// delivery tables.
///
/// Replay and discard serialize their check-and-mutate with `FOR UPDATE`
/// row locks inside one transaction, so two operators cannot double-replay
/// the same dead letter.
pub struct PostgresDeliveryStore {
    pool: PgPool,
    requests: String,
    attempts: String,
    receipts: String,
    dead_letters: String,
}

impl PostgresDeliveryStore {
    /// Build a store on an existing pool, creating tables and the required
    /// indexes if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, DeliveryError> {
        let store = Self {
            pool,
            requests: format!("{schema}.delivery_requests"),
            attempts: format!("{schema}.delivery_attempts"),
            receipts: format!("{schema}.delivery_receipts"),
            dead_letters: format!("{schema}.delivery_dead_letter"),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), DeliveryError> {
        let requests = &self.requests;
        let attempts = &self.attempts;
        let receipts = &self.receipts;
        let dead_letters = &self.dead_letters;

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {requests} (
                    id UUID PRIMARY KEY,
                    idempotency_key TEXT NOT NULL UNIQUE,
                    request_id UUID,
                    origin_butler TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    intent TEXT NOT NULL,
                    target_identity TEXT,
                    message_content TEXT NOT NULL,
                    subject TEXT,
                    request_envelope JSONB NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    completed_at TIMESTAMPTZ
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_requests_request_id_idx \
                 ON {requests} (request_id)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_requests_origin_idx \
                 ON {requests} (origin_butler)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_requests_channel_status_idx \
                 ON {requests} (channel, status)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {attempts} (
                    id BIGSERIAL PRIMARY KEY,
                    delivery_request_id UUID NOT NULL REFERENCES {requests} (id),
                    attempt_number INT NOT NULL,
                    outcome TEXT NOT NULL,
                    started_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    completed_at TIMESTAMPTZ,
                    error_class TEXT,
                    error_detail TEXT,
                    UNIQUE (delivery_request_id, attempt_number)
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_attempts_request_started_idx \
                 ON {attempts} (delivery_request_id, started_at)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {receipts} (
                    id BIGSERIAL PRIMARY KEY,
                    delivery_request_id UUID NOT NULL REFERENCES {requests} (id),
                    provider_id TEXT NOT NULL,
                    raw JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_receipts_request_idx \
                 ON {receipts} (delivery_request_id)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_receipts_provider_idx \
                 ON {receipts} (provider_id)"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {dead_letters} (
                    id UUID PRIMARY KEY,
                    delivery_request_id UUID NOT NULL UNIQUE REFERENCES {requests} (id),
                    quarantine_reason TEXT NOT NULL,
                    error_class TEXT NOT NULL,
                    error_summary TEXT NOT NULL,
                    total_attempts INT NOT NULL,
                    first_attempt_at TIMESTAMPTZ,
                    last_attempt_at TIMESTAMPTZ,
                    original_request_envelope JSONB NOT NULL,
                    all_attempt_outcomes JSONB NOT NULL DEFAULT '[]'::jsonb,
                    replay_eligible BOOLEAN NOT NULL DEFAULT TRUE,
                    replay_count INT NOT NULL DEFAULT 0,
                    discarded_at TIMESTAMPTZ,
                    discard_reason TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_dead_letter_replay_idx \
                 ON {dead_letters} (replay_eligible, created_at DESC) \
                 WHERE discarded_at IS NULL"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS delivery_dead_letter_class_idx \
                 ON {dead_letters} (error_class)"
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    const REQUEST_COLUMNS: &'static str =
        "id, idempotency_key, request_id, origin_butler, channel, intent, target_identity, \
         message_content, subject, request_envelope, status, created_at, completed_at";

    fn request_from_pg(row: &sqlx::postgres::PgRow) -> Result<DeliveryRequestRow, DeliveryError> {
        let status: String = row.get("status");
        Ok(DeliveryRequestRow {
            id: row.get("id"),
            idempotency_key: row.get("idempotency_key"),
            request_id: row.get("request_id"),
            origin_butler: row.get("origin_butler"),
            channel: row.get("channel"),
            intent: row.get("intent"),
            target_identity: row.get("target_identity"),
            message_content: row.get("message_content"),
            subject: row.get("subject"),
            request_envelope: row.get("request_envelope"),
            status: DeliveryStatus::from_str(&status).map_err(DeliveryError::Serialization)?,
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
        })
    }

    const DEAD_LETTER_SELECT: &'static str =
        "SELECT ddl.id, ddl.delivery_request_id, dr.origin_butler, dr.channel, dr.intent, \
                dr.target_identity, dr.idempotency_key, ddl.quarantine_reason, \
                ddl.error_class, ddl.error_summary, ddl.total_attempts, \
                ddl.first_attempt_at, ddl.last_attempt_at, ddl.original_request_envelope, \
                ddl.all_attempt_outcomes, ddl.replay_eligible, ddl.replay_count, \
                ddl.discarded_at, ddl.discard_reason, ddl.created_at";

    fn dead_letter_from_pg(
        row: &sqlx::postgres::PgRow,
    ) -> Result<DeadLetterRecord, DeliveryError> {
        let error_class: String = row.get("error_class");
        Ok(DeadLetterRecord {
            id: row.get("id"),
            delivery_request_id: row.get("delivery_request_id"),
            origin_butler: row.get("origin_butler"),
            channel: row.get("channel"),
            intent: row.get("intent"),
            target_identity: row.get("target_identity"),
            idempotency_key: row.get("idempotency_key"),
            quarantine_reason: row.get("quarantine_reason"),
            error_class: ErrorClass::from_str(&error_class)
                .map_err(DeliveryError::Serialization)?,
            error_summary: row.get("error_summary"),
            total_attempts: row.get::<i32, _>("total_attempts") as u32,
            first_attempt_at: row.get("first_attempt_at"),
            last_attempt_at: row.get("last_attempt_at"),
            original_request_envelope: row.get("original_request_envelope"),
            all_attempt_outcomes: row.get("all_attempt_outcomes"),
            replay_eligible: row.get("replay_eligible"),
            replay_count: row.get::<i32, _>("replay_count") as u32,
            discarded_at: row.get("discarded_at"),
            discard_reason: row.get("discard_reason"),
            created_at: row.get("created_at"),
        })
    }

    /// Lock one dead letter (joined with its request) inside `tx`.
    async fn lock_dead_letter(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dead_letter_id: Uuid,
    ) -> Result<Option<DeadLetterRecord>, DeliveryError> {
        let query = format!(
            "{} FROM {} ddl JOIN {} dr ON ddl.delivery_request_id = dr.id \
             WHERE ddl.id = $1 FOR UPDATE OF ddl",
            Self::DEAD_LETTER_SELECT,
            self.dead_letters,
            self.requests
        );
        let row = sqlx::query(&query)
            .bind(dead_letter_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::dead_letter_from_pg).transpose()
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn submit(&self, submit: DeliverySubmit) -> Result<SubmitOutcome, DeliveryError> {
        let id = Uuid::now_v7();
        let insert = format!(
            "INSERT INTO {} \
                 (id, idempotency_key, request_id, origin_butler, channel, intent, \
                  target_identity, message_content, subject, request_envelope, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending') \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING id",
            self.requests
        );
        let inserted: Option<(Uuid,)> = sqlx::query_as(&insert)
            .bind(id)
            .bind(&submit.idempotency_key)
            .bind(submit.request_id)
            .bind(&submit.origin_butler)
            .bind(&submit.channel)
            .bind(&submit.intent)
            .bind(&submit.target_identity)
            .bind(&submit.message_content)
            .bind(&submit.subject)
            .bind(&submit.request_envelope)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        if let Some((delivery_id,)) = inserted {
            return Ok(SubmitOutcome {
                delivery_id,
                duplicate: false,
            });
        }

        let select = format!(
            "SELECT id FROM {} WHERE idempotency_key = $1",
            self.requests
        );
        let (delivery_id,): (Uuid,) = sqlx::query_as(&select)
            .bind(&submit.idempotency_key)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(SubmitOutcome {
            delivery_id,
            duplicate: true,
        })
    }

    async fn get_request(
        &self,
        delivery_id: Uuid,
    ) -> Result<Option<DeliveryRequestRow>, DeliveryError> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            Self::REQUEST_COLUMNS,
            self.requests
        );
        let row = sqlx::query(&query)
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::request_from_pg).transpose()
    }

    async fn set_status(
        &self,
        delivery_id: Uuid,
        status: DeliveryStatus,
    ) -> Result<(), DeliveryError> {
        let terminal = matches!(
            status,
            DeliveryStatus::Delivered | DeliveryStatus::DeadLettered
        );
        let query = format!(
            "UPDATE {} SET status = $2, \
                 completed_at = CASE WHEN $3 THEN now() ELSE completed_at END \
             WHERE id = $1",
            self.requests
        );
        let result = sqlx::query(&query)
            .bind(delivery_id)
            .bind(status.as_str())
            .bind(terminal)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(DeliveryError::RequestNotFound(delivery_id));
        }
        Ok(())
    }

    async fn begin_attempt(&self, delivery_id: Uuid) -> Result<u32, DeliveryError> {
        let query = format!(
            "INSERT INTO {attempts} (delivery_request_id, attempt_number, outcome) \
             SELECT $1, COALESCE(MAX(attempt_number), 0) + 1, 'in_progress' \
             FROM {attempts} WHERE delivery_request_id = $1 \
             RETURNING attempt_number",
            attempts = self.attempts
        );
        let (attempt_number,): (i32,) = sqlx::query_as(&query)
            .bind(delivery_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(attempt_number as u32)
    }

    async fn finish_attempt(
        &self,
        delivery_id: Uuid,
        attempt_number: u32,
        outcome: AttemptOutcome,
        error_class: Option<ErrorClass>,
        error_detail: Option<&str>,
    ) -> Result<(), DeliveryError> {
        let query = format!(
            "UPDATE {} SET outcome = $3, completed_at = now(), \
                 error_class = $4, error_detail = $5 \
             WHERE delivery_request_id = $1 AND attempt_number = $2",
            self.attempts
        );
        let result = sqlx::query(&query)
            .bind(delivery_id)
            .bind(attempt_number as i32)
            .bind(outcome.as_str())
            .bind(error_class.map(ErrorClass::as_str))
            .bind(error_detail)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(DeliveryError::RequestNotFound(delivery_id));
        }
        Ok(())
    }

    async fn attempts(&self, delivery_id: Uuid) -> Result<Vec<DeliveryAttempt>, DeliveryError> {
        let query = format!(
            "SELECT delivery_request_id, attempt_number, outcome, started_at, \
                    completed_at, error_class, error_detail \
             FROM {} WHERE delivery_request_id = $1 ORDER BY attempt_number",
            self.attempts
        );
        let rows = sqlx::query(&query)
            .bind(delivery_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| {
                let outcome: String = row.get("outcome");
                let error_class: Option<String> = row.get("error_class");
                Ok(DeliveryAttempt {
                    delivery_request_id: row.get("delivery_request_id"),
                    attempt_number: row.get::<i32, _>("attempt_number") as u32,
                    outcome: AttemptOutcome::from_str(&outcome)
                        .map_err(DeliveryError::Serialization)?,
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    error_class: error_class
                        .as_deref()
                        .map(ErrorClass::from_str)
                        .transpose()
                        .map_err(DeliveryError::Serialization)?,
                    error_detail: row.get("error_detail"),
                })
            })
            .collect()
    }

    async fn record_receipt(
        &self,
        delivery_id: Uuid,
        provider_id: &str,
        raw: Value,
    ) -> Result<(), DeliveryError> {
        let query = format!(
            "INSERT INTO {} (delivery_request_id, provider_id, raw) VALUES ($1, $2, $3)",
            self.receipts
        );
        sqlx::query(&query)
            .bind(delivery_id)
            .bind(provider_id)
            .bind(&raw)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery_id: Uuid,
        quarantine_reason: &str,
        error_class: ErrorClass,
        error_summary: &str,
    ) -> Result<Uuid, DeliveryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let existing_query = format!(
            "SELECT id FROM {} WHERE delivery_request_id = $1",
            self.dead_letters
        );
        let existing: Option<(Uuid,)> = sqlx::query_as(&existing_query)
            .bind(delivery_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        if let Some((id,)) = existing {
            tx.commit().await.map_err(backend)?;
            return Ok(id);
        }

        let envelope_query = format!(
            "SELECT request_envelope FROM {} WHERE id = $1",
            self.requests
        );
        let envelope: Option<(Value,)> = sqlx::query_as(&envelope_query)
            .bind(delivery_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;
        let (envelope,) = envelope.ok_or(DeliveryError::RequestNotFound(delivery_id))?;

        let id = Uuid::now_v7();
        let insert = format!(
            "INSERT INTO {dead_letters} \
                 (id, delivery_request_id, quarantine_reason, error_class, error_summary, \
                  total_attempts, first_attempt_at, last_attempt_at, \
                  original_request_envelope, all_attempt_outcomes, replay_eligible) \
             SELECT $1, $2, $3, $4, $5, \
                    COUNT(a.*), MIN(a.started_at), MAX(a.started_at), \
                    $6, \
                    COALESCE(jsonb_agg(jsonb_build_object(
                        'attempt_number', a.attempt_number,
                        'outcome', a.outcome,
                        'error_class', a.error_class,
                        'error_detail', a.error_detail
                    ) ORDER BY a.attempt_number) FILTER (WHERE a.id IS NOT NULL), '[]'::jsonb), \
                    $7 \
             FROM {attempts} a WHERE a.delivery_request_id = $2",
            dead_letters = self.dead_letters,
            attempts = self.attempts
        );
        sqlx::query(&insert)
            .bind(id)
            .bind(delivery_id)
            .bind(quarantine_reason)
            .bind(error_class.as_str())
            .bind(error_summary)
            .bind(&envelope)
            .bind(error_class.default_replay_eligible())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(id)
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<DeadLetterPage, DeliveryError> {
        let limit = filter.effective_limit();
        let query = format!(
            "{} FROM {} ddl JOIN {} dr ON ddl.delivery_request_id = dr.id \
             WHERE ($1::boolean OR ddl.discarded_at IS NULL) \
               AND ($2::text IS NULL OR dr.channel = $2) \
               AND ($3::text IS NULL OR dr.origin_butler = $3) \
               AND ($4::text IS NULL OR ddl.error_class = $4) \
               AND ($5::timestamptz IS NULL OR ddl.created_at >= $5) \
             ORDER BY ddl.created_at DESC \
             LIMIT $6",
            Self::DEAD_LETTER_SELECT,
            self.dead_letters,
            self.requests
        );
        let rows = sqlx::query(&query)
            .bind(filter.include_discarded)
            .bind(&filter.channel)
            .bind(&filter.origin_butler)
            .bind(filter.error_class.map(ErrorClass::as_str))
            .bind(filter.since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        let dead_letters: Vec<DeadLetterRecord> = rows
            .iter()
            .map(Self::dead_letter_from_pg)
            .collect::<Result<_, _>>()?;
        Ok(DeadLetterPage {
            count: dead_letters.len(),
            dead_letters,
            limit,
        })
    }

    async fn inspect_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<Option<DeadLetterRecord>, DeliveryError> {
        let query = format!(
            "{} FROM {} ddl JOIN {} dr ON ddl.delivery_request_id = dr.id \
             WHERE ddl.id = $1",
            Self::DEAD_LETTER_SELECT,
            self.dead_letters,
            self.requests
        );
        let row = sqlx::query(&query)
            .bind(dead_letter_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::dead_letter_from_pg).transpose()
    }

    async fn replay_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<ReplayOutcome, DeliveryError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let dead_letter = self
            .lock_dead_letter(&mut tx, dead_letter_id)
            .await?
            .ok_or(DeliveryError::DeadLetterNotFound(dead_letter_id))?;

        if let Some(discarded_at) = dead_letter.discarded_at {
            return Err(DeliveryError::AlreadyDiscarded {
                id: dead_letter_id,
                discarded_at,
            });
        }
        if !dead_letter.replay_eligible {
            return Err(DeliveryError::NotReplayEligible {
                id: dead_letter_id,
                reason: "replay_eligible is false".into(),
            });
        }

        let replay_number = dead_letter.replay_count + 1;
        let new_key = replay_idempotency_key(&dead_letter.idempotency_key, replay_number);
        let new_id = Uuid::now_v7();

        let clone = format!(
            "INSERT INTO {requests} \
                 (id, idempotency_key, request_id, origin_butler, channel, intent, \
                  target_identity, message_content, subject, request_envelope, status) \
             SELECT $1, $2, request_id, origin_butler, channel, intent, \
                    target_identity, message_content, subject, request_envelope, 'pending' \
             FROM {requests} WHERE id = $3",
            requests = self.requests
        );
        sqlx::query(&clone)
            .bind(new_id)
            .bind(&new_key)
            .bind(dead_letter.delivery_request_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let bump = format!(
            "UPDATE {} SET replay_count = replay_count + 1 WHERE id = $1",
            self.dead_letters
        );
        sqlx::query(&bump)
            .bind(dead_letter_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(ReplayOutcome {
            replayed_delivery_id: new_id,
            original_dead_letter_id: dead_letter_id,
            replay_number,
            new_idempotency_key: new_key,
        })
    }

    async fn discard_dead_letter(
        &self,
        dead_letter_id: Uuid,
        reason: &str,
    ) -> Result<(), DeliveryError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(DeliveryError::EmptyDiscardReason);
        }

        let mut tx = self.pool.begin().await.map_err(backend)?;
        let dead_letter = self
            .lock_dead_letter(&mut tx, dead_letter_id)
            .await?
            .ok_or(DeliveryError::DeadLetterNotFound(dead_letter_id))?;
        if let Some(discarded_at) = dead_letter.discarded_at {
            return Err(DeliveryError::AlreadyDiscarded {
                id: dead_letter_id,
                discarded_at,
            });
        }

        let update = format!(
            "UPDATE {} SET discarded_at = now(), discard_reason = $2, \
                 replay_eligible = FALSE \
             WHERE id = $1",
            self.dead_letters
        );
        sqlx::query(&update)
            .bind(dead_letter_id)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::InFlight,
            DeliveryStatus::Delivered,
            DeliveryStatus::DeadLettered,
        ] {
            assert_eq!(
                DeliveryStatus::from_str(status.as_str()).unwrap(),
                status
            );
        }
    }
}
