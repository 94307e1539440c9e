use async_trait::async_trait;
use thiserror::Error;

use crate::record::{ButlerRecord, ButlerRegistration};

/// Errors from registry storage operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by routing operations; each carries a stable code used in
/// tool error responses.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("butler not found: {0}")]
    ButlerNotFound(String),

    #[error("butler '{name}' is not eligible for routing ({reason})")]
    ButlerIneligible { name: String, reason: String },

    #[error("butler '{name}' is unreachable: {detail}")]
    ButlerUnreachable { name: String, detail: String },

    #[error("butler '{0}' does not have the mailbox module enabled")]
    MailboxNotEnabled(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl RoutingError {
    /// Stable code string for tool responses and telemetry.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ButlerNotFound(_) => "butler_not_found",
            Self::ButlerIneligible { .. } => "butler_ineligible",
            Self::ButlerUnreachable { .. } => "butler_unreachable",
            Self::MailboxNotEnabled(_) => "mailbox_not_enabled",
            Self::Registry(_) => "registry_error",
        }
    }
}

/// Storage for the butler catalog.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Upsert a registration and refresh `last_seen_at`. Re-registering an
    /// existing butler updates its endpoint, modules, and contract range but
    /// preserves quarantine state.
    async fn register(&self, registration: ButlerRegistration) -> Result<(), RegistryError>;

    /// Fetch one butler by name.
    async fn get(&self, name: &str) -> Result<Option<ButlerRecord>, RegistryError>;

    /// All registered butlers, sorted by name.
    async fn list(&self) -> Result<Vec<ButlerRecord>, RegistryError>;

    /// Refresh `last_seen_at` to now. Returns whether the butler exists.
    async fn mark_seen(&self, name: &str) -> Result<bool, RegistryError>;

    /// Operator quarantine: blocks routing until cleared.
    async fn quarantine(&self, name: &str, reason: &str) -> Result<bool, RegistryError>;

    /// Clear quarantine, restoring `active`.
    async fn clear_quarantine(&self, name: &str) -> Result<bool, RegistryError>;

    /// Mark a butler as draining: in-flight work may finish, no new routes.
    async fn set_draining(&self, name: &str) -> Result<bool, RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_error_codes() {
        assert_eq!(
            RoutingError::ButlerNotFound("x".into()).code(),
            "butler_not_found"
        );
        assert_eq!(
            RoutingError::MailboxNotEnabled("x".into()).code(),
            "mailbox_not_enabled"
        );
        assert_eq!(
            RoutingError::ButlerIneligible {
                name: "x".into(),
                reason: "quarantined".into()
            }
            .code(),
            "butler_ineligible"
        );
    }
}
