use thiserror::Error;

/// Errors from state and secret store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("CAS conflict on '{key}': expected version {expected}, actual {actual:?}")]
    CasConflict {
        key: String,
        expected: u64,
        /// Current stored version; `None` when the key does not exist.
        actual: Option<u64>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("credential '{key}' is not configured: {hint}")]
    CredentialMissing { key: String, hint: String },

    #[error("credential '{key}' is invalid: {detail}")]
    CredentialInvalid { key: String, detail: String },

    #[error("backend error: {0}")]
    Backend(String),
}

impl StateError {
    /// Stable code string for tool responses and telemetry.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::CasConflict { .. } => "cas_conflict",
            Self::Serialization(_) => "serialization_error",
            Self::CredentialMissing { .. } => "credential_missing",
            Self::CredentialInvalid { .. } => "credential_invalid",
            Self::Backend(_) => "backend_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_conflict_display_carries_both_versions() {
        let err = StateError::CasConflict {
            key: "k".into(),
            expected: 1,
            actual: Some(2),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("expected version 1"));
        assert!(rendered.contains("2"));
        assert_eq!(err.code(), "cas_conflict");
    }
}
