//! Conformance suites for store backends.
//!
//! Each backend's test module calls these with a fresh store so that every
//! implementation honors the same semantics: versioning, CAS conflict
//! behavior, secret redaction.

use serde_json::json;

use crate::error::StateError;
use crate::secrets::{SecretStore, SecretWriteOptions};
use crate::store::StateStore;

/// Run the full state store conformance suite against `store`.
///
/// # Panics
///
/// Panics on any semantic violation; backend errors propagate as `Err`.
pub async fn run_state_conformance(store: &dyn StateStore) -> Result<(), StateError> {
    // Missing key reads as None.
    assert!(store.get("missing").await?.is_none());
    assert!(store.get_with_version("missing").await?.is_none());

    // First write is version 1; every subsequent write increments by one.
    let v1 = store.set("k", &json!("v1")).await?;
    assert_eq!(v1, 1);
    let v2 = store.set("k", &json!("v2")).await?;
    assert_eq!(v2, 2);
    let (value, version) = store.get_with_version("k").await?.expect("k exists");
    assert_eq!(value, json!("v2"));
    assert_eq!(version, 2);

    // CAS success returns expected + 1.
    let v3 = store.compare_and_set("k", 2, &json!("v3")).await?;
    assert_eq!(v3, 3);
    assert_eq!(store.get("k").await?, Some(json!("v3")));

    // CAS conflict surfaces expected and actual, and leaves the value alone.
    let err = store
        .compare_and_set("k", 1, &json!("clobber"))
        .await
        .expect_err("stale CAS must fail");
    match err {
        StateError::CasConflict {
            key,
            expected,
            actual,
        } => {
            assert_eq!(key, "k");
            assert_eq!(expected, 1);
            assert_eq!(actual, Some(3));
        }
        other => panic!("expected CasConflict, got {other:?}"),
    }
    assert_eq!(store.get("k").await?, Some(json!("v3")));

    // CAS on a missing key reports actual = None.
    let err = store
        .compare_and_set("ghost", 1, &json!("x"))
        .await
        .expect_err("CAS on missing key must fail");
    assert!(matches!(
        err,
        StateError::CasConflict { actual: None, .. }
    ));

    // Delete is idempotent; a rewritten key restarts at version 1.
    store.delete("k").await?;
    store.delete("k").await?;
    assert!(store.get("k").await?.is_none());
    assert_eq!(store.set("k", &json!("fresh")).await?, 1);

    // Prefix listing.
    store.set("cursor/gmail", &json!({"n": 1})).await?;
    store.set("cursor/telegram", &json!({"n": 2})).await?;
    store.set("other", &json!(true)).await?;
    let mut keys = store.list_keys(Some("cursor/")).await?;
    keys.sort();
    assert_eq!(keys, vec!["cursor/gmail", "cursor/telegram"]);
    let entries = store.list_entries(Some("cursor/")).await?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.version >= 1));
    let all_keys = store.list_keys(None).await?;
    assert!(all_keys.len() >= 4);

    Ok(())
}

/// Run the full secret store conformance suite against `store`.
///
/// # Panics
///
/// Panics on any semantic violation; backend errors propagate as `Err`.
pub async fn run_secret_conformance(store: &dyn SecretStore) -> Result<(), StateError> {
    assert!(store.load("absent").await?.is_none());
    assert!(!store.has("absent").await?);
    assert!(!store.delete("absent").await?);

    store
        .store(
            "telegram_bot_token",
            "1234:ABCD",
            SecretWriteOptions::default().with_category("telegram"),
        )
        .await?;
    assert_eq!(
        store.load("telegram_bot_token").await?.as_deref(),
        Some("1234:ABCD")
    );
    assert!(store.has("telegram_bot_token").await?);

    // Upsert replaces the value.
    store
        .store(
            "telegram_bot_token",
            "5678:EFGH",
            SecretWriteOptions::default().with_category("telegram"),
        )
        .await?;
    assert_eq!(
        store.load("telegram_bot_token").await?.as_deref(),
        Some("5678:EFGH")
    );

    store
        .store("openai_api_key", "sk-xyz", SecretWriteOptions::default())
        .await?;

    // Listing never exposes values and honors the category filter.
    let all = store.list_secrets(None).await?;
    assert!(all.len() >= 2);
    for meta in &all {
        assert!(meta.is_set);
        let rendered = format!("{meta:?}");
        assert!(!rendered.contains("5678:EFGH"));
        assert!(!rendered.contains("sk-xyz"));
    }
    let telegram_only = store.list_secrets(Some("telegram")).await?;
    assert_eq!(telegram_only.len(), 1);
    assert_eq!(telegram_only[0].key, "telegram_bot_token");

    assert!(store.delete("telegram_bot_token").await?);
    assert!(store.load("telegram_bot_token").await?.is_none());

    Ok(())
}
