use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use butlers_state::error::StateError;
use butlers_state::secrets::{SecretMetadata, SecretSource, SecretStore, SecretWriteOptions};

#[derive(Debug, Clone)]
struct StoredSecret {
    value: String,
    category: String,
    description: Option<String>,
    is_sensitive: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredSecret {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// In-memory [`SecretStore`]. Expired secrets behave as absent on read.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    data: DashMap<String, StoredSecret>,
}

impl MemorySecretStore {
    /// Create a new, empty in-memory secret store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store(
        &self,
        key: &str,
        value: &str,
        options: SecretWriteOptions,
    ) -> Result<(), StateError> {
        let now = Utc::now();
        let created_at = self
            .data
            .get(key)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        self.data.insert(
            key.to_owned(),
            StoredSecret {
                value: value.to_owned(),
                category: options.category,
                description: options.description,
                is_sensitive: options.is_sensitive,
                created_at,
                updated_at: now,
                expires_at: options.expires_at,
            },
        );
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StateError> {
        Ok(self
            .data
            .get(key)
            .filter(|s| !s.is_expired())
            .map(|s| s.value.clone()))
    }

    async fn has(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.data.get(key).is_some_and(|s| !s.is_expired()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StateError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn list_secrets(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<SecretMetadata>, StateError> {
        Ok(self
            .data
            .iter()
            .filter(|e| category.is_none_or(|c| e.category == c))
            .map(|e| SecretMetadata {
                key: e.key().clone(),
                category: e.category.clone(),
                description: e.description.clone(),
                is_sensitive: e.is_sensitive,
                is_set: !e.value.is_empty() && !e.is_expired(),
                created_at: e.created_at,
                updated_at: e.updated_at,
                expires_at: e.expires_at,
                source: SecretSource::Database,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn conformance() {
        let store = MemorySecretStore::new();
        butlers_state::testing::run_secret_conformance(&store)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_secret_reads_as_absent() {
        let store = MemorySecretStore::new();
        let mut options = SecretWriteOptions::default();
        options.expires_at = Some(Utc::now() - Duration::seconds(1));
        store.store("stale", "value", options).await.unwrap();

        assert!(store.load("stale").await.unwrap().is_none());
        assert!(!store.has("stale").await.unwrap());
    }

    #[tokio::test]
    async fn env_fallback_resolution() {
        // We don't modify env vars (that requires `unsafe` in Rust 2024);
        // PATH is present in any test environment, so it stands in for a
        // secret that only exists in the environment.
        let store = MemorySecretStore::new();

        let resolved = butlers_state::resolve_secret(&store, "PATH", true)
            .await
            .unwrap();
        assert!(resolved.is_some());

        // DB value wins over the environment.
        store
            .store("PATH", "from-db", SecretWriteOptions::default())
            .await
            .unwrap();
        let resolved = butlers_state::resolve_secret(&store, "PATH", true)
            .await
            .unwrap();
        assert_eq!(resolved.as_deref(), Some("from-db"));

        // Fallback disabled: a key absent from the store stays absent even
        // though the environment could answer.
        let fresh = MemorySecretStore::new();
        let resolved = butlers_state::resolve_secret(&fresh, "PATH", false)
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn google_credentials_resolution() {
        let store = MemorySecretStore::new();

        let err = butlers_state::resolve_google_credentials(&store)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bootstrap"));

        store
            .store(
                butlers_state::GOOGLE_CREDENTIALS_KEY,
                "{\"client_id\": \"c\"}",
                SecretWriteOptions::default().with_category("google"),
            )
            .await
            .unwrap();
        let err = butlers_state::resolve_google_credentials(&store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "credential_invalid");

        store
            .store(
                butlers_state::GOOGLE_CREDENTIALS_KEY,
                "{\"client_id\": \"c\", \"client_secret\": \"s\", \"refresh_token\": \"r\"}",
                SecretWriteOptions::default().with_category("google"),
            )
            .await
            .unwrap();
        let creds = butlers_state::resolve_google_credentials(&store)
            .await
            .unwrap();
        assert_eq!(creds.client_id, "c");
        assert!(creds.scope.is_none());
    }
}
