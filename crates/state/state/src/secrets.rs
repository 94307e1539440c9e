use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StateError;

/// Key under which the shared Google OAuth credential blob is stored.
pub const GOOGLE_CREDENTIALS_KEY: &str = "google";

/// Where a resolved secret value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Database,
    Environment,
}

impl SecretSource {
    /// Stable string for dashboards and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Environment => "environment",
        }
    }
}

/// Metadata about a stored secret. Never includes the raw value.
#[derive(Clone)]
pub struct SecretMetadata {
    pub key: String,
    pub category: String,
    pub description: Option<String>,
    /// When true the value must be masked in UI and log output.
    pub is_sensitive: bool,
    /// Whether the secret currently has a non-empty value.
    pub is_set: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` means the secret never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub source: SecretSource,
}

impl std::fmt::Debug for SecretMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMetadata")
            .field("key", &self.key)
            .field("category", &self.category)
            .field("is_set", &self.is_set)
            .field("source", &self.source.as_str())
            .finish_non_exhaustive()
    }
}

/// Options applied when writing a secret.
#[derive(Debug, Clone)]
pub struct SecretWriteOptions {
    pub category: String,
    pub description: Option<String>,
    pub is_sensitive: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for SecretWriteOptions {
    fn default() -> Self {
        Self {
            category: "general".into(),
            description: None,
            is_sensitive: true,
            expires_at: None,
        }
    }
}

impl SecretWriteOptions {
    /// Set the grouping category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

/// Named credential store backed by the butler's secrets table.
///
/// Write operations log only the key and category, never the value.
/// Expired secrets behave as absent on read.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Upsert a secret. Calling again with a new value replaces the old one.
    async fn store(
        &self,
        key: &str,
        value: &str,
        options: SecretWriteOptions,
    ) -> Result<(), StateError>;

    /// Load a secret value from the store only (no environment fallback).
    async fn load(&self, key: &str) -> Result<Option<String>, StateError>;

    /// Whether a live (non-expired) secret exists for `key`.
    async fn has(&self, key: &str) -> Result<bool, StateError>;

    /// Delete a secret. Returns whether a row was removed.
    async fn delete(&self, key: &str) -> Result<bool, StateError>;

    /// List secret metadata, optionally filtered by category. Raw values are
    /// never included.
    async fn list_secrets(
        &self,
        category: Option<&str>,
    ) -> Result<Vec<SecretMetadata>, StateError>;
}

/// Resolve a secret DB-first, falling back to the process environment when
/// `env_fallback` is set.
pub async fn resolve_secret(
    store: &dyn SecretStore,
    key: &str,
    env_fallback: bool,
) -> Result<Option<String>, StateError> {
    if let Some(value) = store.load(key).await? {
        debug!(key, source = "database", "resolved secret");
        return Ok(Some(value));
    }
    if env_fallback
        && let Ok(value) = std::env::var(key)
        && !value.is_empty()
    {
        debug!(key, source = "environment", "resolved secret");
        return Ok(Some(value));
    }
    Ok(None)
}

/// Shared Google OAuth credentials, stored as one JSON blob under
/// [`GOOGLE_CREDENTIALS_KEY`].
#[derive(Clone, Serialize, Deserialize)]
pub struct GoogleCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for GoogleCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Load and validate the shared Google OAuth credential blob.
///
/// Fails with an actionable error when the blob is missing or structurally
/// invalid, pointing the operator at the bootstrap flow.
pub async fn resolve_google_credentials(
    store: &dyn SecretStore,
) -> Result<GoogleCredentials, StateError> {
    let raw = store
        .load(GOOGLE_CREDENTIALS_KEY)
        .await?
        .ok_or_else(|| StateError::CredentialMissing {
            key: GOOGLE_CREDENTIALS_KEY.into(),
            hint: "run the Google OAuth bootstrap to store client_id, client_secret, \
                   and refresh_token"
                .into(),
        })?;

    let credentials: GoogleCredentials =
        serde_json::from_str(&raw).map_err(|e| StateError::CredentialInvalid {
            key: GOOGLE_CREDENTIALS_KEY.into(),
            detail: format!("not a valid credential blob ({e}); re-run the bootstrap"),
        })?;

    if credentials.client_id.is_empty()
        || credentials.client_secret.is_empty()
        || credentials.refresh_token.is_empty()
    {
        return Err(StateError::CredentialInvalid {
            key: GOOGLE_CREDENTIALS_KEY.into(),
            detail: "client_id, client_secret, and refresh_token must all be non-empty; \
                     re-run the bootstrap"
                .into(),
        });
    }

    Ok(credentials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_debug_is_redacted() {
        let meta = SecretMetadata {
            key: "telegram_bot_token".into(),
            category: "telegram".into(),
            description: Some("bot token".into()),
            is_sensitive: true,
            is_set: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            expires_at: None,
            source: SecretSource::Database,
        };
        let rendered = format!("{meta:?}");
        assert!(rendered.contains("telegram_bot_token"));
        assert!(!rendered.contains("description"));
    }

    #[test]
    fn google_credentials_debug_masks_secrets() {
        let creds = GoogleCredentials {
            client_id: "client-1".into(),
            client_secret: "s3cret".into(),
            refresh_token: "r3fresh".into(),
            scope: None,
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("client-1"));
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("s3cret"));
        assert!(!rendered.contains("r3fresh"));
    }

    #[test]
    fn write_options_default_to_sensitive_general() {
        let options = SecretWriteOptions::default();
        assert_eq!(options.category, "general");
        assert!(options.is_sensitive);
        assert!(options.expires_at.is_none());
    }
}
