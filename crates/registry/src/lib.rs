//! Authoritative catalog of reachable butlers and the routing primitives
//! built on top of it.
//!
//! The registry tracks each butler's endpoint, modules, and eligibility. A
//! butler is routable only while `active` and fresh within its liveness TTL;
//! quarantine blocks routing until an operator clears it, and `draining`
//! admits in-flight work but no new routes. Every routing attempt -- success
//! or failure -- lands in the append-only routing log, which also feeds the
//! Switchboard's thread-affinity lookup.

mod memory;
mod postgres;
mod record;
mod router;
mod routing_log;
mod store;
mod transport;

pub use memory::{MemoryRegistry, MemoryRoutingLog};
pub use postgres::{PostgresRegistry, PostgresRoutingLog};
pub use record::{ButlerRecord, ButlerRegistration, EligibilityState};
pub use router::{
    DispatchResult, RouteOrigin, Router, TickFailure, TickSummary, aggregate_responses,
    parse_classifier_output,
};
pub use routing_log::{AffinityHistory, RoutingLogEntry, RoutingLogStore};
pub use store::{RegistryError, RegistryStore, RoutingError};
pub use transport::{ButlerTransport, HttpButlerTransport, TransportError};
