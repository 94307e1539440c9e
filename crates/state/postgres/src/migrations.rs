use sqlx::PgPool;

use crate::config::PostgresConfig;

/// Create the state and secrets tables for a butler schema if they do not
/// exist.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {}", config.schema);

    let state_table = config.state_table();
    let create_state = format!(
        "CREATE TABLE IF NOT EXISTS {state_table} (
            key TEXT PRIMARY KEY,
            value JSONB NOT NULL,
            version BIGINT NOT NULL DEFAULT 1,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    );

    let secrets_table = config.secrets_table();
    let create_secrets = format!(
        "CREATE TABLE IF NOT EXISTS {secrets_table} (
            secret_key TEXT PRIMARY KEY,
            secret_value TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'general',
            description TEXT,
            is_sensitive BOOLEAN NOT NULL DEFAULT TRUE,
            expires_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    );

    let create_secrets_category_idx = format!(
        "CREATE INDEX IF NOT EXISTS butler_secrets_category_idx \
         ON {secrets_table} (category)"
    );

    sqlx::query(&create_schema).execute(pool).await?;
    sqlx::query(&create_state).execute(pool).await?;
    sqlx::query(&create_secrets).execute(pool).await?;
    sqlx::query(&create_secrets_category_idx)
        .execute(pool)
        .await?;

    Ok(())
}
