//! Deterministic pre-classification triage for the Switchboard.
//!
//! Every accepted ingest envelope passes through a bounded, synchronous
//! pipeline before any LLM is consulted:
//!
//! 1. Thread affinity (email only): if the thread recently routed to exactly
//!    one butler, route there again.
//! 2. Deterministic rules, walked in `(priority ASC, created_at ASC, id ASC)`
//!    order; first match wins.
//! 3. No match: pass through to LLM classification downstream.
//!
//! The evaluator itself performs no I/O; callers supply the rule cache and a
//! [`RoutingHistory`] implementation for the affinity lookup. Every failure
//! path fails open to `pass_through` -- triage is never allowed to block
//! ingestion.

pub mod affinity;
pub mod evaluator;
pub mod rule;
pub mod telemetry;

pub use affinity::{
    AffinityOutcome, AffinityResult, AffinitySettings, HistoryError, RoutingHistory,
    lookup_thread_affinity,
};
pub use evaluator::{Disposition, TriageDecision, TriageSummary, evaluate};
pub use rule::{
    DomainMatch, HeaderOp, RuleAction, RuleCondition, RuleParseError, RuleType, TriageRule,
    sort_rules,
};
pub use telemetry::TriageTelemetry;

// Re-exported so affinity callers don't need a direct contracts dependency.
pub use butlers_contracts::SourceChannel;
