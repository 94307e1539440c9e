use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};

use butlers_state::error::StateError;
use butlers_state::store::{StateEntry, StateStore};

use crate::config::PostgresConfig;
use crate::migrations;

fn backend(e: sqlx::Error) -> StateError {
    StateError::Backend(e.to_string())
}

/// PostgreSQL-backed [`StateStore`].
///
/// Versioning is enforced in SQL: `INSERT .. ON CONFLICT DO UPDATE SET
/// version = version + 1` for plain writes, and a version-guarded `UPDATE`
/// for CAS so two concurrent writers cannot both succeed.
pub struct PostgresStateStore {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresStateStore {
    /// Connect, run migrations, and return a ready store.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Connection`] if the pool cannot be created, or
    /// [`StateError::Backend`] if migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StateError> {
        let pool = config.connect().await?;
        Ok(Self { pool, config })
    }

    /// Build a store from an existing pool (shared across backends).
    /// Runs migrations on creation.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> Result<Self, StateError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(backend)?;
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        let table = self.config.state_table();
        let query = format!("SELECT value FROM {table} WHERE key = $1");
        let row: Option<(Value,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|(v,)| v))
    }

    async fn get_with_version(&self, key: &str) -> Result<Option<(Value, u64)>, StateError> {
        let table = self.config.state_table();
        let query = format!("SELECT value, version FROM {table} WHERE key = $1");
        let row: Option<(Value, i64)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|(v, version)| (v, version as u64)))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<u64, StateError> {
        let table = self.config.state_table();
        let query = format!(
            "INSERT INTO {table} (key, value, version, updated_at) \
             VALUES ($1, $2, 1, now()) \
             ON CONFLICT (key) DO UPDATE \
             SET value = EXCLUDED.value, \
                 version = {table}.version + 1, \
                 updated_at = now() \
             RETURNING version"
        );
        let (version,): (i64,) = sqlx::query_as(&query)
            .bind(key)
            .bind(value)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        Ok(version as u64)
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        let table = self.config.state_table();
        let query = format!("DELETE FROM {table} WHERE key = $1");
        sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StateError> {
        let table = self.config.state_table();
        let query = format!(
            "SELECT key FROM {table} \
             WHERE ($1::text IS NULL OR key LIKE $1 || '%') \
             ORDER BY key"
        );
        let rows = sqlx::query(&query)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }

    async fn list_entries(&self, prefix: Option<&str>) -> Result<Vec<StateEntry>, StateError> {
        let table = self.config.state_table();
        let query = format!(
            "SELECT key, value, version FROM {table} \
             WHERE ($1::text IS NULL OR key LIKE $1 || '%') \
             ORDER BY key"
        );
        let rows = sqlx::query(&query)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        Ok(rows
            .iter()
            .map(|r| StateEntry {
                key: r.get("key"),
                value: r.get("value"),
                version: r.get::<i64, _>("version") as u64,
            })
            .collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &Value,
    ) -> Result<u64, StateError> {
        let table = self.config.state_table();
        let query = format!(
            "UPDATE {table} \
             SET value = $3, version = version + 1, updated_at = now() \
             WHERE key = $1 AND version = $2 \
             RETURNING version"
        );
        let updated: Option<(i64,)> = sqlx::query_as(&query)
            .bind(key)
            .bind(expected_version as i64)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        if let Some((version,)) = updated {
            return Ok(version as u64);
        }

        // Guarded update missed: report the actual version (or absence).
        let actual = self
            .get_with_version(key)
            .await?
            .map(|(_, version)| version);
        Err(StateError::CasConflict {
            key: key.to_owned(),
            expected: expected_version,
            actual,
        })
    }
}
