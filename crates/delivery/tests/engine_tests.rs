//! End-to-end tests for the delivery engine over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use butlers_delivery::providers::{MockProvider, ScriptedOutcome};
use butlers_delivery::{
    AttemptOutcome, ChannelProvider, DeadLetterFilter, DeliveryEngine, DeliveryError,
    DeliveryStatus, DeliveryStore, DeliverySubmit, EngineConfig, ErrorClass, MemoryDeliveryStore,
    RetryStrategy,
};

fn fast_config(max_attempts: u32) -> EngineConfig {
    EngineConfig {
        max_attempts,
        retry: RetryStrategy::Constant {
            delay: Duration::from_millis(1),
        },
    }
}

fn submit(key: &str) -> DeliverySubmit {
    DeliverySubmit {
        idempotency_key: key.to_owned(),
        request_id: None,
        origin_butler: "health".into(),
        channel: "telegram".into(),
        intent: "send".into(),
        target_identity: Some("u1".into()),
        message_content: "hi".into(),
        subject: None,
        request_envelope: json!({"schema_version": "notify.v1"}),
    }
}

fn engine_with(
    store: Arc<MemoryDeliveryStore>,
    provider: Arc<MockProvider>,
    max_attempts: u32,
) -> DeliveryEngine {
    DeliveryEngine::new(store, fast_config(max_attempts))
        .with_provider(provider as Arc<dyn ChannelProvider>)
}

#[tokio::test]
async fn first_submit_delivers_and_records_receipt() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::delivering("telegram"));
    let engine = engine_with(Arc::clone(&store), Arc::clone(&provider), 3);

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    assert!(!outcome.duplicate);
    assert_eq!(outcome.status, DeliveryStatus::Delivered);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(provider.sends(), 1);

    let receipt = store.receipt(outcome.delivery_id).unwrap();
    assert_eq!(receipt.provider_id, outcome.provider_id.unwrap());

    let attempts = store.attempts(outcome.delivery_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn duplicate_idempotency_key_returns_existing_without_new_attempt() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::delivering("telegram"));
    let engine = engine_with(Arc::clone(&store), Arc::clone(&provider), 3);

    let first = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    let second = engine.submit_and_deliver(submit("k-1")).await.unwrap();

    assert!(second.duplicate);
    assert_eq!(second.delivery_id, first.delivery_id);
    assert_eq!(second.status, DeliveryStatus::Delivered);
    // No second send, no second attempt row.
    assert_eq!(provider.sends(), 1);
    assert_eq!(store.attempts(first.delivery_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failure_retries_then_succeeds() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::scripted(
        "telegram",
        vec![
            ScriptedOutcome::Fail(ErrorClass::TransientNetwork),
            ScriptedOutcome::Fail(ErrorClass::RateLimited),
            ScriptedOutcome::Deliver,
        ],
    ));
    let engine = engine_with(Arc::clone(&store), Arc::clone(&provider), 3);

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::Delivered);
    assert_eq!(outcome.attempts, 3);

    let attempts = store.attempts(outcome.delivery_id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Error);
    assert_eq!(attempts[0].error_class, Some(ErrorClass::TransientNetwork));
    assert_eq!(attempts[1].error_class, Some(ErrorClass::RateLimited));
    assert_eq!(attempts[2].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_request() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::failing("telegram", ErrorClass::Timeout));
    let engine = engine_with(Arc::clone(&store), Arc::clone(&provider), 3);

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::DeadLettered);
    assert_eq!(outcome.attempts, 3);
    let dead_letter_id = outcome.dead_letter_id.unwrap();

    let record = store
        .inspect_dead_letter(dead_letter_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.error_class, ErrorClass::Timeout);
    assert_eq!(record.total_attempts, 3);
    assert!(record.replay_eligible);
    assert_eq!(record.replay_count, 0);
    assert_eq!(record.all_attempt_outcomes.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn permanent_failure_dead_letters_immediately() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::failing(
        "telegram",
        ErrorClass::PermanentValidation,
    ));
    let engine = engine_with(Arc::clone(&store), Arc::clone(&provider), 5);

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::DeadLettered);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(provider.sends(), 1);

    let record = store
        .inspect_dead_letter(outcome.dead_letter_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    // Validation failures replay identically, so they default ineligible.
    assert!(!record.replay_eligible);
}

#[tokio::test]
async fn missing_provider_dead_letters_without_attempts() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let engine = DeliveryEngine::new(
        Arc::clone(&store) as Arc<dyn DeliveryStore>,
        fast_config(3),
    );

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    assert_eq!(outcome.status, DeliveryStatus::DeadLettered);
    assert_eq!(outcome.attempts, 0);
}

#[tokio::test]
async fn replay_clones_request_under_suffixed_key() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let failing = Arc::new(MockProvider::failing("telegram", ErrorClass::Timeout));
    let engine = engine_with(Arc::clone(&store), failing, 2);

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    let dead_letter_id = outcome.dead_letter_id.unwrap();

    // Replay with a now-healthy provider.
    let healthy = Arc::new(MockProvider::delivering("telegram"));
    let engine = engine_with(Arc::clone(&store), Arc::clone(&healthy), 2);
    let replayed = engine.replay_and_deliver(dead_letter_id).await.unwrap();
    assert_eq!(replayed.status, DeliveryStatus::Delivered);
    assert_ne!(replayed.delivery_id, outcome.delivery_id);

    let cloned = store
        .get_request(replayed.delivery_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cloned.idempotency_key, "k-1::replay-1");
    assert_eq!(cloned.message_content, "hi");

    let record = store
        .inspect_dead_letter(dead_letter_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.replay_count, 1);

    // A second replay gets the next suffix.
    let again = store.replay_dead_letter(dead_letter_id).await.unwrap();
    assert_eq!(again.new_idempotency_key, "k-1::replay-2");
    assert_eq!(again.replay_number, 2);
}

#[tokio::test]
async fn discard_blocks_replay_and_is_single_shot() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::failing("telegram", ErrorClass::Timeout));
    let engine = engine_with(Arc::clone(&store), provider, 1);

    let outcome = engine.submit_and_deliver(submit("k-1")).await.unwrap();
    let dead_letter_id = outcome.dead_letter_id.unwrap();

    // Empty reasons are rejected.
    assert!(matches!(
        store.discard_dead_letter(dead_letter_id, "  ").await,
        Err(DeliveryError::EmptyDiscardReason)
    ));

    store
        .discard_dead_letter(dead_letter_id, "user unsubscribed")
        .await
        .unwrap();

    // Discard is terminal: replay refuses, a second discard errors.
    assert!(matches!(
        store.replay_dead_letter(dead_letter_id).await,
        Err(DeliveryError::AlreadyDiscarded { .. })
    ));
    assert!(matches!(
        store.discard_dead_letter(dead_letter_id, "again").await,
        Err(DeliveryError::AlreadyDiscarded { .. })
    ));

    let record = store
        .inspect_dead_letter(dead_letter_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.replay_eligible);
    assert_eq!(record.discard_reason.as_deref(), Some("user unsubscribed"));
    let assessment = record.replay_assessment();
    assert!(!assessment.eligible);
    assert_eq!(assessment.reasons.len(), 2);
}

#[tokio::test]
async fn dead_letter_listing_filters_and_clamps() {
    let store = Arc::new(MemoryDeliveryStore::new());
    let provider = Arc::new(MockProvider::failing("telegram", ErrorClass::Timeout));
    let engine = engine_with(Arc::clone(&store), provider, 1);

    for i in 0..3 {
        engine
            .submit_and_deliver(submit(&format!("k-{i}")))
            .await
            .unwrap();
    }
    let listed = store
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(listed.count, 3);
    assert_eq!(listed.limit, 50);

    // Newest first.
    let created: Vec<_> = listed.dead_letters.iter().map(|d| d.created_at).collect();
    assert!(created.windows(2).all(|w| w[0] >= w[1]));

    // Channel filter excludes everything else.
    let none = store
        .list_dead_letters(&DeadLetterFilter {
            channel: Some("email".into()),
            ..DeadLetterFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(none.count, 0);

    // Error-class filter and clamped limits.
    let filtered = store
        .list_dead_letters(&DeadLetterFilter {
            error_class: Some(ErrorClass::Timeout),
            limit: Some(2),
            ..DeadLetterFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.count, 2);
    let clamped = store
        .list_dead_letters(&DeadLetterFilter {
            limit: Some(9999),
            ..DeadLetterFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(clamped.limit, 500);

    // Discarded rows disappear unless opted in.
    let first_id = listed.dead_letters[0].id;
    store
        .discard_dead_letter(first_id, "operator cleanup")
        .await
        .unwrap();
    let visible = store
        .list_dead_letters(&DeadLetterFilter::default())
        .await
        .unwrap();
    assert_eq!(visible.count, 2);
    let all = store
        .list_dead_letters(&DeadLetterFilter {
            include_discarded: true,
            ..DeadLetterFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(all.count, 3);
}
