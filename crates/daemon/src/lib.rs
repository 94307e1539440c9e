//! Butler daemon assembly.
//!
//! A butler daemon is one process: configuration from `butler.toml`, a
//! module registry ordered by dependencies, per-butler stores, the spawner,
//! the scheduler loop, a startup recovery sweep over the route inbox, and an
//! MCP tool surface. The Switchboard is a butler like any other, plus the
//! ingest/triage pipeline that turns connector events into routed envelopes.

pub mod config;
mod daemon;
mod mailbox;
mod mcp;
pub mod migrate;
mod modules;
mod switchboard;
pub mod telemetry;

pub use config::{ButlerConfig, ConfigError, DbConfig, RuntimeConfig, TelemetryConfig};
pub use daemon::{ButlerDaemon, DaemonError};
pub use mailbox::{MailboxMessage, MailboxStore, MemoryMailbox, PostgresMailbox};
pub use mcp::ButlerMcpServer;
pub use modules::{ModuleDef, ModuleRegistry, ModuleRegistryError};
pub use switchboard::{
    IngestDisposition, SwitchboardPipeline, TriageRuleCache, affinity_settings_from_row,
    migrate_switchboard_tables,
};
