use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Terminal failure taxonomy for delivery attempts.
///
/// The class decides whether another attempt is worth making and whether a
/// dead letter defaults to replay-eligible. Stable snake_case strings are
/// stored in `error_class` columns and used as telemetry labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Timeout,
    RateLimited,
    PermanentValidation,
    TransientNetwork,
    ProviderError,
    Unknown,
}

impl ErrorClass {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::PermanentValidation => "permanent_validation",
            Self::TransientNetwork => "transient_network",
            Self::ProviderError => "provider_error",
            Self::Unknown => "unknown",
        }
    }

    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::TransientNetwork | Self::ProviderError
        )
    }

    /// Default `replay_eligible` for a dead letter with this terminal class.
    /// Validation failures will fail identically on replay.
    #[must_use]
    pub fn default_replay_eligible(self) -> bool {
        self != Self::PermanentValidation
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timeout" => Ok(Self::Timeout),
            "rate_limited" => Ok(Self::RateLimited),
            "permanent_validation" => Ok(Self::PermanentValidation),
            "transient_network" => Ok(Self::TransientNetwork),
            "provider_error" => Ok(Self::ProviderError),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel provider failed to deliver.
#[derive(Debug, Clone, Error)]
#[error("{class}: {detail}")]
pub struct ProviderSendError {
    pub class: ErrorClass,
    pub detail: String,
}

impl ProviderSendError {
    /// Build an error with the given class.
    #[must_use]
    pub fn new(class: ErrorClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

/// Errors from the delivery store and dead-letter operations.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    #[error("dead letter {id} is not eligible for replay: {reason}")]
    NotReplayEligible { id: Uuid, reason: String },

    #[error("dead letter {id} is already discarded (at {discarded_at})")]
    AlreadyDiscarded {
        id: Uuid,
        discarded_at: DateTime<Utc>,
    },

    #[error("discard reason is required and cannot be empty")]
    EmptyDiscardReason,

    #[error("no provider registered for channel '{0}'")]
    NoProviderForChannel(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_round_trips() {
        for class in [
            ErrorClass::Timeout,
            ErrorClass::RateLimited,
            ErrorClass::PermanentValidation,
            ErrorClass::TransientNetwork,
            ErrorClass::ProviderError,
            ErrorClass::Unknown,
        ] {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
    }

    #[test]
    fn retry_policy_by_class() {
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(ErrorClass::TransientNetwork.is_retryable());
        assert!(ErrorClass::ProviderError.is_retryable());
        assert!(!ErrorClass::PermanentValidation.is_retryable());
        assert!(!ErrorClass::Unknown.is_retryable());
    }

    #[test]
    fn replay_defaults() {
        assert!(!ErrorClass::PermanentValidation.default_replay_eligible());
        assert!(ErrorClass::Timeout.default_replay_eligible());
        assert!(ErrorClass::Unknown.default_replay_eligible());
    }
}
