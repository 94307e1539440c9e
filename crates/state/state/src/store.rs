use async_trait::async_trait;
use serde_json::Value;

use crate::error::StateError;

/// A key paired with its stored value, as returned by listing operations.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub key: String,
    pub value: Value,
    pub version: u64,
}

/// Per-butler JSONB key-value store with versioned writes.
///
/// Every write increments the key's version by exactly one (first write is
/// version 1). [`compare_and_set`](StateStore::compare_and_set) provides
/// optimistic concurrency: it succeeds only when the caller's expected
/// version matches the stored one, and never mutates the value on conflict.
///
/// Implementations must be `Send + Sync` and safe for concurrent access.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Get the value for a key. Returns `None` if not present.
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError>;

    /// Get the value and its current version.
    async fn get_with_version(&self, key: &str) -> Result<Option<(Value, u64)>, StateError>;

    /// Write a value unconditionally. Returns the new version: 1 on insert,
    /// `previous + 1` on update.
    async fn set(&self, key: &str, value: &Value) -> Result<u64, StateError>;

    /// Delete a key. Deleting a missing key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), StateError>;

    /// List keys, optionally filtered to those starting with `prefix`.
    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StateError>;

    /// List full entries, optionally filtered by key prefix.
    async fn list_entries(&self, prefix: Option<&str>) -> Result<Vec<StateEntry>, StateError>;

    /// Compare-and-set: write `value` only if the stored version equals
    /// `expected_version`, returning the new version (`expected + 1`).
    ///
    /// On mismatch, fails with [`StateError::CasConflict`] carrying both the
    /// expected and the actual version (`None` when the key is absent); the
    /// stored value is left untouched.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &Value,
    ) -> Result<u64, StateError>;
}
