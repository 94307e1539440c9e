use butlers_state::error::StateError;

/// Configuration for the `PostgreSQL` state and secret store backends.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection URL (e.g. `postgres://butler_health_rw@localhost:5432/butlers`).
    pub url: String,

    /// Maximum number of connections in the `sqlx` pool.
    pub pool_size: u32,

    /// Schema owning this butler's tables (e.g. `"health"`).
    pub schema: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: String::from("postgres://localhost:5432/butlers"),
            pool_size: 5,
            schema: String::from("public"),
        }
    }
}

impl PostgresConfig {
    /// Create a config for a butler schema with the default pool size.
    #[must_use]
    pub fn new(url: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: schema.into(),
            ..Self::default()
        }
    }

    /// Fully-qualified state KV table name.
    pub(crate) fn state_table(&self) -> String {
        format!("{}.butler_state", self.schema)
    }

    /// Fully-qualified secrets table name.
    pub(crate) fn secrets_table(&self) -> String {
        format!("{}.butler_secrets", self.schema)
    }

    /// Build `PgConnectOptions` from the URL.
    pub(crate) fn connect_options(
        &self,
    ) -> Result<sqlx::postgres::PgConnectOptions, StateError> {
        self.url
            .parse()
            .map_err(|e: sqlx::Error| StateError::Connection(e.to_string()))
    }

    /// Create a connection pool and run migrations for this config.
    pub async fn connect(&self) -> Result<sqlx::PgPool, StateError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(self.pool_size)
            .connect_with(self.connect_options()?)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;
        crate::migrations::run_migrations(&pool, self)
            .await
            .map_err(|e| StateError::Backend(e.to_string()))?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_schema_qualified() {
        let cfg = PostgresConfig::new("postgres://localhost/butlers", "health");
        assert_eq!(cfg.state_table(), "health.butler_state");
        assert_eq!(cfg.secrets_table(), "health.butler_secrets");
    }

    #[test]
    fn default_values() {
        let cfg = PostgresConfig::default();
        assert_eq!(cfg.pool_size, 5);
        assert_eq!(cfg.schema, "public");
    }
}
