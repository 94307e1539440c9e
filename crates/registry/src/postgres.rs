use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::record::{ButlerRecord, ButlerRegistration, EligibilityState};
use crate::routing_log::{RoutingLogEntry, RoutingLogStore};
use crate::store::{RegistryError, RegistryStore};

fn backend(e: sqlx::Error) -> RegistryError {
    RegistryError::Backend(e.to_string())
}

/// PostgreSQL-backed [`RegistryStore`] over the `butler_registry` table.
pub struct PostgresRegistry {
    pool: PgPool,
    table: String,
}

impl PostgresRegistry {
    /// Build a registry on an existing pool, creating the table if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, RegistryError> {
        let table = format!("{schema}.butler_registry");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                name TEXT PRIMARY KEY,
                endpoint_url TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                modules JSONB NOT NULL DEFAULT '[]'::jsonb,
                capabilities JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                route_contract_min TEXT NOT NULL DEFAULT 'route.v1',
                route_contract_max TEXT NOT NULL DEFAULT 'route.v1',
                eligibility_state TEXT NOT NULL DEFAULT 'active',
                liveness_ttl_seconds BIGINT NOT NULL DEFAULT 120,
                last_seen_at TIMESTAMPTZ,
                quarantined_at TIMESTAMPTZ,
                quarantine_reason TEXT,
                registered_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        sqlx::query(&create).execute(&pool).await.map_err(backend)?;
        Ok(Self { pool, table })
    }

    fn record_from_pg(row: &sqlx::postgres::PgRow) -> Result<ButlerRecord, RegistryError> {
        let modules: serde_json::Value = row.get("modules");
        let modules = modules
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        let state: String = row.get("eligibility_state");
        Ok(ButlerRecord {
            name: row.get("name"),
            endpoint_url: row.get("endpoint_url"),
            description: row.get("description"),
            modules,
            capabilities: row.get("capabilities"),
            route_contract_min: row.get("route_contract_min"),
            route_contract_max: row.get("route_contract_max"),
            eligibility_state: EligibilityState::from_str(&state)
                .map_err(RegistryError::Serialization)?,
            liveness_ttl_seconds: row.get::<i64, _>("liveness_ttl_seconds") as u64,
            last_seen_at: row.get("last_seen_at"),
            quarantined_at: row.get("quarantined_at"),
            quarantine_reason: row.get("quarantine_reason"),
            registered_at: row.get("registered_at"),
        })
    }

    const RECORD_COLUMNS: &'static str =
        "name, endpoint_url, description, modules, capabilities, \
         route_contract_min, route_contract_max, eligibility_state, \
         liveness_ttl_seconds, last_seen_at, quarantined_at, quarantine_reason, \
         registered_at";
}

#[async_trait]
impl RegistryStore for PostgresRegistry {
    async fn register(&self, registration: ButlerRegistration) -> Result<(), RegistryError> {
        let table = &self.table;
        let modules = serde_json::to_value(&registration.modules)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;
        let query = format!(
            "INSERT INTO {table} \
                 (name, endpoint_url, description, modules, capabilities, \
                  route_contract_min, route_contract_max, liveness_ttl_seconds, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now()) \
             ON CONFLICT (name) DO UPDATE \
             SET endpoint_url = EXCLUDED.endpoint_url, \
                 description = EXCLUDED.description, \
                 modules = EXCLUDED.modules, \
                 capabilities = EXCLUDED.capabilities, \
                 route_contract_min = EXCLUDED.route_contract_min, \
                 route_contract_max = EXCLUDED.route_contract_max, \
                 liveness_ttl_seconds = EXCLUDED.liveness_ttl_seconds, \
                 last_seen_at = now()"
        );
        sqlx::query(&query)
            .bind(&registration.name)
            .bind(&registration.endpoint_url)
            .bind(&registration.description)
            .bind(&modules)
            .bind(&registration.capabilities)
            .bind(&registration.route_contract_min)
            .bind(&registration.route_contract_max)
            .bind(registration.liveness_ttl_seconds as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<ButlerRecord>, RegistryError> {
        let query = format!(
            "SELECT {} FROM {} WHERE name = $1",
            Self::RECORD_COLUMNS,
            self.table
        );
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::record_from_pg).transpose()
    }

    async fn list(&self) -> Result<Vec<ButlerRecord>, RegistryError> {
        let query = format!(
            "SELECT {} FROM {} ORDER BY name",
            Self::RECORD_COLUMNS,
            self.table
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::record_from_pg).collect()
    }

    async fn mark_seen(&self, name: &str) -> Result<bool, RegistryError> {
        let query = format!("UPDATE {} SET last_seen_at = now() WHERE name = $1", self.table);
        let result = sqlx::query(&query)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn quarantine(&self, name: &str, reason: &str) -> Result<bool, RegistryError> {
        let query = format!(
            "UPDATE {} SET eligibility_state = 'quarantined', \
                 quarantined_at = now(), quarantine_reason = $2 \
             WHERE name = $1",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(name)
            .bind(reason)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_quarantine(&self, name: &str) -> Result<bool, RegistryError> {
        let query = format!(
            "UPDATE {} SET eligibility_state = 'active', \
                 quarantined_at = NULL, quarantine_reason = NULL \
             WHERE name = $1",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_draining(&self, name: &str) -> Result<bool, RegistryError> {
        let query = format!(
            "UPDATE {} SET eligibility_state = 'draining' WHERE name = $1",
            self.table
        );
        let result = sqlx::query(&query)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL-backed [`RoutingLogStore`] over the `routing_log` table.
pub struct PostgresRoutingLog {
    pool: PgPool,
    table: String,
}

impl PostgresRoutingLog {
    /// Build a log on an existing pool, creating the table if needed.
    pub async fn new(pool: PgPool, schema: &str) -> Result<Self, RegistryError> {
        let table = format!("{schema}.routing_log");
        let create = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                source_butler TEXT NOT NULL,
                target_butler TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                success BOOLEAN NOT NULL,
                duration_ms BIGINT,
                error TEXT,
                source_channel TEXT,
                thread_id TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        let create_idx = format!(
            "CREATE INDEX IF NOT EXISTS routing_log_thread_idx \
             ON {table} (thread_id, created_at DESC) \
             WHERE source_channel = 'email'"
        );
        sqlx::query(&create).execute(&pool).await.map_err(backend)?;
        sqlx::query(&create_idx)
            .execute(&pool)
            .await
            .map_err(backend)?;
        Ok(Self { pool, table })
    }
}

#[async_trait]
impl RoutingLogStore for PostgresRoutingLog {
    async fn append(&self, entry: RoutingLogEntry) -> Result<(), RegistryError> {
        let query = format!(
            "INSERT INTO {} \
                 (source_butler, target_butler, tool_name, success, duration_ms, \
                  error, source_channel, thread_id, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table
        );
        sqlx::query(&query)
            .bind(&entry.source_butler)
            .bind(&entry.target_butler)
            .bind(&entry.tool_name)
            .bind(entry.success)
            .bind(entry.duration_ms.map(|d| d as i64))
            .bind(&entry.error)
            .bind(&entry.source_channel)
            .bind(&entry.thread_id)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn recent_thread_targets(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<Vec<String>, RegistryError> {
        let query = format!(
            "SELECT target_butler, MAX(created_at) AS last_routed_at \
             FROM {} \
             WHERE source_channel = 'email' \
               AND thread_id = $1 \
               AND created_at >= now() - ($2 * INTERVAL '1 day') \
             GROUP BY target_butler \
             ORDER BY last_routed_at DESC \
             LIMIT 2",
            self.table
        );
        let rows = sqlx::query(&query)
            .bind(thread_id)
            .bind(f64::from(ttl_days))
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("target_butler"))
            .collect())
    }

    async fn has_stale_thread_history(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<bool, RegistryError> {
        let query = format!(
            "SELECT 1 FROM {} \
             WHERE source_channel = 'email' \
               AND thread_id = $1 \
               AND created_at < now() - ($2 * INTERVAL '1 day') \
             LIMIT 1",
            self.table
        );
        let row = sqlx::query(&query)
            .bind(thread_id)
            .bind(f64::from(ttl_days))
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }
}
