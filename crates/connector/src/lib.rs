//! Connector-side plumbing: metrics and the heartbeat loop.
//!
//! Connectors are separate processes bridging a provider (telegram, IMAP,
//! chat) to the Switchboard's ingest endpoint. This crate gives them two
//! things: a [`ConnectorMetrics`] object holding cumulative per-label
//! counters, and a [`Heartbeat`] background task that periodically snapshots
//! those counters into a `connector.heartbeat.v1` envelope and submits it.
//! Heartbeat failures are logged and swallowed -- liveness reporting must
//! never block ingestion.

mod heartbeat;
mod metrics;

pub use heartbeat::{
    CheckpointFn, HealthStateFn, Heartbeat, HeartbeatConfig, HeartbeatSink, RecordingSink,
};
pub use metrics::{ConnectorMetrics, IngestTracker};

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_S: u64 = 120;

/// Lower bound on the heartbeat interval.
pub const MIN_HEARTBEAT_INTERVAL_S: u64 = 30;

/// Upper bound on the heartbeat interval.
pub const MAX_HEARTBEAT_INTERVAL_S: u64 = 300;
