//! PostgreSQL backends for the butler state and secret stores.
//!
//! Each butler owns one schema; tables are created on store construction via
//! `CREATE TABLE IF NOT EXISTS` and runtime-role grants are applied
//! best-effort (missing roles are skipped, never fatal).

pub mod acl;
pub mod config;
pub mod migrations;
mod secrets;
mod store;

pub use config::PostgresConfig;
pub use secrets::PostgresSecretStore;
pub use store::PostgresStateStore;
