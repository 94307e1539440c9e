use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::error::{DeliveryError, ProviderSendError};
use crate::request::{AttemptOutcome, DeliveryOutcome, DeliveryRequestRow, DeliveryStatus, DeliverySubmit};
use crate::retry::RetryStrategy;
use crate::store::DeliveryStore;

/// Provider acknowledgment for a delivered message.
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    /// Provider-side message id, recorded in `delivery_receipts`.
    pub provider_message_id: String,
    /// Raw provider response for audit.
    pub raw: Value,
}

/// A channel backend able to write one delivery to the external world.
///
/// Implementations classify their failures into the delivery error taxonomy;
/// the engine never inspects provider-specific errors itself.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Provider instance name, for logs.
    fn name(&self) -> &str;

    /// The channel this provider serves (`telegram`, `email`, ...).
    fn channel(&self) -> &str;

    /// Deliver the request. Must tolerate redelivery of the same request.
    async fn send(&self, request: &DeliveryRequestRow)
    -> Result<ProviderReceipt, ProviderSendError>;
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum attempts per delivery request (including the first).
    pub max_attempts: u32,
    pub retry: RetryStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry: RetryStrategy::default(),
        }
    }
}

/// Drives delivery requests through submit, attempts, receipt, and
/// dead-letter.
pub struct DeliveryEngine {
    store: Arc<dyn DeliveryStore>,
    providers: HashMap<String, Arc<dyn ChannelProvider>>,
    config: EngineConfig,
}

impl DeliveryEngine {
    /// Build an engine over a store with no providers registered yet.
    pub fn new(store: Arc<dyn DeliveryStore>, config: EngineConfig) -> Self {
        Self {
            store,
            providers: HashMap::new(),
            config,
        }
    }

    /// Register a provider for its channel, replacing any previous one.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ChannelProvider>) -> Self {
        self.providers
            .insert(provider.channel().to_owned(), provider);
        self
    }

    /// Access the underlying store (dead-letter tooling goes through it).
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DeliveryStore> {
        &self.store
    }

    /// Admit a request and drive it to a terminal state.
    ///
    /// A duplicate idempotency key short-circuits: the existing delivery id
    /// is returned with `duplicate = true` and no attempt is started.
    /// Otherwise attempts run until success, a non-retryable class, or
    /// `max_attempts`; exhaustion or a permanent failure dead-letters the
    /// request.
    #[instrument(skip(self, submit), fields(idempotency_key = %submit.idempotency_key, channel = %submit.channel))]
    pub async fn submit_and_deliver(
        &self,
        submit: DeliverySubmit,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let admitted = self.store.submit(submit).await?;
        if admitted.duplicate {
            info!(delivery_id = %admitted.delivery_id, "duplicate submit; returning existing request");
            let status = self
                .store
                .get_request(admitted.delivery_id)
                .await?
                .map_or(DeliveryStatus::Pending, |r| r.status);
            return Ok(DeliveryOutcome {
                delivery_id: admitted.delivery_id,
                duplicate: true,
                status,
                attempts: 0,
                provider_id: None,
                dead_letter_id: None,
            });
        }

        self.deliver(admitted.delivery_id).await
    }

    /// Drive an admitted (pending) request to a terminal state.
    pub async fn deliver(&self, delivery_id: uuid::Uuid) -> Result<DeliveryOutcome, DeliveryError> {
        let request = self
            .store
            .get_request(delivery_id)
            .await?
            .ok_or(DeliveryError::RequestNotFound(delivery_id))?;

        let Some(provider) = self.providers.get(&request.channel) else {
            // No provider is a configuration problem, not a transient one.
            let dead_letter_id = self
                .store
                .dead_letter(
                    delivery_id,
                    "no provider registered for channel",
                    crate::ErrorClass::PermanentValidation,
                    &format!("channel '{}' has no provider", request.channel),
                )
                .await?;
            self.store
                .set_status(delivery_id, DeliveryStatus::DeadLettered)
                .await?;
            return Ok(DeliveryOutcome {
                delivery_id,
                duplicate: false,
                status: DeliveryStatus::DeadLettered,
                attempts: 0,
                provider_id: None,
                dead_letter_id: Some(dead_letter_id),
            });
        };

        self.store
            .set_status(delivery_id, DeliveryStatus::InFlight)
            .await?;

        let mut last_error: Option<ProviderSendError> = None;
        for _ in 0..self.config.max_attempts {
            let attempt_number = self.store.begin_attempt(delivery_id).await?;

            match provider.send(&request).await {
                Ok(receipt) => {
                    self.store
                        .finish_attempt(
                            delivery_id,
                            attempt_number,
                            AttemptOutcome::Success,
                            None,
                            None,
                        )
                        .await?;
                    self.store
                        .record_receipt(
                            delivery_id,
                            &receipt.provider_message_id,
                            receipt.raw,
                        )
                        .await?;
                    self.store
                        .set_status(delivery_id, DeliveryStatus::Delivered)
                        .await?;
                    info!(
                        delivery_id = %delivery_id,
                        attempt = attempt_number,
                        provider = provider.name(),
                        "delivered"
                    );
                    return Ok(DeliveryOutcome {
                        delivery_id,
                        duplicate: false,
                        status: DeliveryStatus::Delivered,
                        attempts: attempt_number,
                        provider_id: Some(receipt.provider_message_id),
                        dead_letter_id: None,
                    });
                }
                Err(e) => {
                    warn!(
                        delivery_id = %delivery_id,
                        attempt = attempt_number,
                        class = %e.class,
                        error = %e.detail,
                        "delivery attempt failed"
                    );
                    self.store
                        .finish_attempt(
                            delivery_id,
                            attempt_number,
                            AttemptOutcome::Error,
                            Some(e.class),
                            Some(&e.detail),
                        )
                        .await?;

                    let will_retry =
                        e.class.is_retryable() && attempt_number < self.config.max_attempts;
                    last_error = Some(e);
                    if !will_retry {
                        break;
                    }
                    tokio::time::sleep(self.config.retry.delay_for(attempt_number - 1)).await;
                }
            }
        }

        let error = last_error.expect("loop ran at least one attempt");
        let attempts = self.store.attempts(delivery_id).await?.len() as u32;
        let quarantine_reason = if error.class.is_retryable() {
            "retry attempts exhausted"
        } else {
            "permanent failure"
        };
        let dead_letter_id = self
            .store
            .dead_letter(delivery_id, quarantine_reason, error.class, &error.detail)
            .await?;
        self.store
            .set_status(delivery_id, DeliveryStatus::DeadLettered)
            .await?;
        warn!(
            delivery_id = %delivery_id,
            dead_letter_id = %dead_letter_id,
            class = %error.class,
            "delivery dead-lettered"
        );

        Ok(DeliveryOutcome {
            delivery_id,
            duplicate: false,
            status: DeliveryStatus::DeadLettered,
            attempts,
            provider_id: None,
            dead_letter_id: Some(dead_letter_id),
        })
    }

    /// Replay a dead letter and immediately drive the cloned request.
    pub async fn replay_and_deliver(
        &self,
        dead_letter_id: uuid::Uuid,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let replay = self.store.replay_dead_letter(dead_letter_id).await?;
        self.deliver(replay.replayed_delivery_id).await
    }
}
