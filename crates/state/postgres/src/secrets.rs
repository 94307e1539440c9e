use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::info;

use butlers_state::error::StateError;
use butlers_state::secrets::{SecretMetadata, SecretSource, SecretStore, SecretWriteOptions};

use crate::config::PostgresConfig;
use crate::migrations;

fn backend(e: sqlx::Error) -> StateError {
    StateError::Backend(e.to_string())
}

/// PostgreSQL-backed [`SecretStore`] over the `butler_secrets` table.
///
/// Reads filter out expired rows; writes log only key and category.
pub struct PostgresSecretStore {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresSecretStore {
    /// Connect, run migrations, and return a ready store.
    pub async fn new(config: PostgresConfig) -> Result<Self, StateError> {
        let pool = config.connect().await?;
        Ok(Self { pool, config })
    }

    /// Build a store from an existing pool. Runs migrations on creation.
    pub async fn from_pool(pool: PgPool, config: PostgresConfig) -> Result<Self, StateError> {
        migrations::run_migrations(&pool, &config)
            .await
            .map_err(backend)?;
        Ok(Self { pool, config })
    }
}

#[async_trait]
impl SecretStore for PostgresSecretStore {
    async fn store(
        &self,
        key: &str,
        value: &str,
        options: SecretWriteOptions,
    ) -> Result<(), StateError> {
        let table = self.config.secrets_table();
        let query = format!(
            "INSERT INTO {table} \
                 (secret_key, secret_value, category, description, is_sensitive, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (secret_key) DO UPDATE \
             SET secret_value = EXCLUDED.secret_value, \
                 category = EXCLUDED.category, \
                 description = EXCLUDED.description, \
                 is_sensitive = EXCLUDED.is_sensitive, \
                 expires_at = EXCLUDED.expires_at, \
                 updated_at = now()"
        );
        sqlx::query(&query)
            .bind(key)
            .bind(value)
            .bind(&options.category)
            .bind(&options.description)
            .bind(options.is_sensitive)
            .bind(options.expires_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        info!(key, category = %options.category, "stored secret");
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StateError> {
        let table = self.config.secrets_table();
        let query = format!(
            "SELECT secret_value FROM {table} \
             WHERE secret_key = $1 AND (expires_at IS NULL OR expires_at > now())"
        );
        let row: Option<(String,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|(v,)| v))
    }

    async fn has(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.load(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        let table = self.config.secrets_table();
        let query = format!("DELETE FROM {table} WHERE secret_key = $1");
        let result = sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_secrets(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<SecretMetadata>, StateError> {
        let table = self.config.secrets_table();
        let query = format!(
            "SELECT secret_key, category, description, is_sensitive, \
                    (secret_value <> '') AS is_set, \
                    created_at, updated_at, expires_at \
             FROM {table} \
             WHERE ($1::text IS NULL OR category = $1) \
             ORDER BY secret_key"
        );
        let rows = sqlx::query(&query)
            .bind(category)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        Ok(rows
            .iter()
            .map(|r| {
                let expires_at: Option<DateTime<Utc>> = r.get("expires_at");
                let expired = expires_at.is_some_and(|at| at <= Utc::now());
                SecretMetadata {
                    key: r.get("secret_key"),
                    category: r.get("category"),
                    description: r.get("description"),
                    is_sensitive: r.get("is_sensitive"),
                    is_set: r.get::<bool, _>("is_set") && !expired,
                    created_at: r.get("created_at"),
                    updated_at: r.get("updated_at"),
                    expires_at,
                    source: SecretSource::Database,
                }
            })
            .collect())
    }
}
