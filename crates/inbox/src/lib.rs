//! Durable route inbox for butler daemons.
//!
//! Every route envelope accepted by a butler is persisted here before any
//! work happens, which is what makes dispatch at-least-once: if the daemon
//! crashes mid-processing, the recovery sweep finds the row and dispatches it
//! again. Rows move through a small lifecycle DAG --
//! `accepted → processing → {processed, errored}` -- with CAS transitions so
//! two concurrent sweeps cannot double-dispatch, and terminal states are
//! write-once.

mod memory;
mod postgres;
mod row;
mod store;
mod sweep;
pub mod testing;

pub use memory::MemoryRouteInbox;
pub use postgres::PostgresRouteInbox;
pub use row::{InboxRow, LifecycleState};
pub use store::{InboxError, RouteInboxStore};
pub use sweep::recovery_sweep;

/// Default grace window before a row is considered stuck, in seconds.
pub const DEFAULT_RECOVERY_GRACE_SECONDS: u64 = 10;

/// Default batch size for recovery scans.
pub const DEFAULT_RECOVERY_BATCH: usize = 100;
