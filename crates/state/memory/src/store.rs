use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use butlers_state::error::StateError;
use butlers_state::store::{StateEntry, StateStore};

/// A stored value with its version counter.
#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    version: u64,
}

/// In-memory [`StateStore`] backed by a [`DashMap`].
///
/// Versioning and CAS use the map's entry API for atomicity; there is no
/// TTL because the production store has none either.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    data: DashMap<String, Entry>,
}

impl MemoryStateStore {
    /// Create a new, empty in-memory state store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        Ok(self.data.get(key).map(|e| e.value.clone()))
    }

    async fn get_with_version(&self, key: &str) -> Result<Option<(Value, u64)>, StateError> {
        Ok(self.data.get(key).map(|e| (e.value.clone(), e.version)))
    }

    async fn set(&self, key: &str, value: &Value) -> Result<u64, StateError> {
        let mut entry = self.data.entry(key.to_owned()).or_insert(Entry {
            value: Value::Null,
            version: 0,
        });
        entry.version += 1;
        entry.value = value.clone();
        Ok(entry.version)
    }

    async fn delete(&self, key: &str) -> Result<(), StateError> {
        self.data.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StateError> {
        Ok(self
            .data
            .iter()
            .filter(|e| prefix.is_none_or(|p| e.key().starts_with(p)))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn list_entries(&self, prefix: Option<&str>) -> Result<Vec<StateEntry>, StateError> {
        Ok(self
            .data
            .iter()
            .filter(|e| prefix.is_none_or(|p| e.key().starts_with(p)))
            .map(|e| StateEntry {
                key: e.key().clone(),
                value: e.value.clone(),
                version: e.version,
            })
            .collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: &Value,
    ) -> Result<u64, StateError> {
        match self.data.entry(key.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if current != expected_version {
                    return Err(StateError::CasConflict {
                        key: key.to_owned(),
                        expected: expected_version,
                        actual: Some(current),
                    });
                }
                let entry = occupied.get_mut();
                entry.version += 1;
                entry.value = value.clone();
                Ok(entry.version)
            }
            dashmap::mapref::entry::Entry::Vacant(_) => Err(StateError::CasConflict {
                key: key.to_owned(),
                expected: expected_version,
                actual: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn conformance() {
        let store = MemoryStateStore::new();
        butlers_state::testing::run_state_conformance(&store)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cas_failure_preserves_value() {
        let store = MemoryStateStore::new();
        store.set("k", &json!("v1")).await.unwrap();
        store.set("k", &json!("v2")).await.unwrap();

        let err = store
            .compare_and_set("k", 1, &json!("v3"))
            .await
            .unwrap_err();
        match err {
            StateError::CasConflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, Some(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.get("k").await.unwrap(), Some(json!("v2")));
    }
}
