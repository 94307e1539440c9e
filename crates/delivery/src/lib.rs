//! Messenger delivery engine.
//!
//! Butlers hand outbound notifications to this engine as delivery requests
//! keyed by a caller-supplied idempotency key. The engine owns the rest:
//! numbered attempts with class-driven retry, provider receipts on success,
//! and a dead-letter row with full forensic context when a request is out of
//! options. Operators list, inspect, replay, and discard dead letters; a
//! replay clones the original envelope under `<key>::replay-<n>` so the
//! idempotency lineage stays visible.
//!
//! Delivery is at-least-once: a duplicate submit returns the existing
//! request instead of sending twice, and providers are expected to tolerate
//! redelivery.

mod engine;
mod error;
mod memory;
mod postgres;
pub mod providers;
mod request;
mod retry;
mod store;

pub use engine::{ChannelProvider, DeliveryEngine, EngineConfig, ProviderReceipt};
pub use error::{DeliveryError, ErrorClass, ProviderSendError};
pub use memory::MemoryDeliveryStore;
pub use postgres::PostgresDeliveryStore;
pub use request::{
    AttemptOutcome, DeadLetterFilter, DeadLetterPage, DeadLetterRecord, DeliveryAttempt,
    DeliveryOutcome, DeliveryReceipt, DeliveryRequestRow, DeliveryStatus, DeliverySubmit,
    ReplayAssessment, ReplayOutcome, SubmitOutcome, replay_idempotency_key,
};
pub use retry::RetryStrategy;
pub use store::DeliveryStore;

/// Default page size for dead-letter listings.
pub const DEAD_LETTER_DEFAULT_LIMIT: usize = 50;

/// Hard cap on dead-letter listing page size.
pub const DEAD_LETTER_MAX_LIMIT: usize = 500;
