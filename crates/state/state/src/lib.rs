//! Store traits shared by every butler daemon.
//!
//! Two concerns live here:
//!
//! - [`StateStore`]: a per-butler JSONB key-value store with monotonically
//!   versioned writes and optimistic compare-and-set.
//! - [`SecretStore`]: named credentials with metadata listing that never
//!   exposes raw values, plus DB-first/environment-fallback resolution.
//!
//! Backends implement the traits (`butlers-state-memory`,
//! `butlers-state-postgres`); the conformance suites in [`testing`] keep
//! their semantics aligned.

pub mod error;
pub mod secrets;
pub mod store;
pub mod testing;

pub use error::StateError;
pub use secrets::{
    GOOGLE_CREDENTIALS_KEY, GoogleCredentials, SecretMetadata, SecretSource, SecretStore,
    SecretWriteOptions, resolve_google_credentials, resolve_secret,
};
pub use store::{StateEntry, StateStore};
