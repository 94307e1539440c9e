use std::time::Duration;

use thiserror::Error;

/// Errors from a runtime adapter invocation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime binary was not found on PATH.
    #[error("runtime binary '{binary}' not found on PATH; {hint}")]
    MissingBinary { binary: String, hint: String },

    /// The invocation exceeded its wall-clock timeout and was killed.
    #[error("runtime invocation timed out after {0:?}")]
    Timeout(Duration),

    /// Spawning or communicating with the subprocess failed.
    #[error("runtime process error: {0}")]
    Process(String),

    /// The runtime produced output this adapter cannot interpret.
    #[error("invalid runtime output: {0}")]
    InvalidOutput(String),

    /// Adapter configuration problem (config file, system prompt).
    #[error("runtime configuration error: {0}")]
    Configuration(String),
}

/// Errors surfaced by the spawner itself.
#[derive(Debug, Error)]
pub enum SpawnerError {
    /// The spawner is draining and no longer accepts triggers.
    #[error("spawner is draining; new sessions are not accepted")]
    Draining,

    /// The session store rejected a write.
    #[error("session store error: {0}")]
    Session(String),

    /// Unknown adapter name in configuration.
    #[error("unknown runtime adapter: {0}")]
    UnknownAdapter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = RuntimeError::Timeout(Duration::from_secs(300));
        assert_eq!(err.to_string(), "runtime invocation timed out after 300s");

        let err = SpawnerError::Draining;
        assert!(err.to_string().contains("draining"));
    }
}
