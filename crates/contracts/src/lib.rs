//! Versioned wire contracts for the butlers fleet.
//!
//! Every payload crossing a process boundary -- connector to Switchboard,
//! Switchboard to butler, butler to messenger -- is a versioned, strict-schema
//! JSON envelope. This crate owns the envelope types, their parse entry
//! points, and the deterministic error codes produced when a payload does not
//! conform. Envelopes are frozen after validation: there is no public
//! mutation, and lineage fields are checked against their parent context
//! whenever a derived envelope is constructed.
//!
//! Contract failures are never retried; they surface to the caller with a
//! stable error code (see [`ContractError::code`]).

pub mod error;
pub mod heartbeat;
pub mod ingest;
pub mod notify;
pub mod route;
pub mod scalar;
pub mod types;

pub use error::ContractError;
pub use heartbeat::{
    HeartbeatCheckpoint, HeartbeatConnector, HeartbeatCounters, HeartbeatEnvelope,
    HeartbeatStatus, parse_heartbeat,
};
pub use ingest::{
    IngestControl, IngestEnvelope, IngestEvent, IngestPayload, IngestSender, IngestSource,
    parse_ingest,
};
pub use notify::{NotifyDelivery, NotifyRequest, parse_notify};
pub use route::{
    RequestContext, RouteEnvelope, RouteInput, RouteSourceMetadata, RouteSubrequest, RouteTarget,
    parse_route,
};
pub use scalar::{NonEmptyString, RequestId, Timestamp, TimestampError};
pub use types::{
    FanoutMode, NotifyChannel, NotifyIntent, PolicyTier, SourceChannel, SourceProvider,
};

/// Exact schema version string for ingest envelopes.
pub const INGEST_SCHEMA_VERSION: &str = "ingest.v1";
/// Exact schema version string for route envelopes.
pub const ROUTE_SCHEMA_VERSION: &str = "route.v1";
/// Exact schema version string for notify requests.
pub const NOTIFY_SCHEMA_VERSION: &str = "notify.v1";
/// Exact schema version string for connector heartbeats.
pub const HEARTBEAT_SCHEMA_VERSION: &str = "connector.heartbeat.v1";
