use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Low-cardinality counters for the triage pipeline.
///
/// Hits are labeled by destination butler, misses by a fixed reason set
/// (`no_thread_id`, `no_history`, `conflict`, `stale`, `disabled`, `error`),
/// so cardinality is bounded by the fleet size plus six.
#[derive(Debug, Default)]
pub struct TriageTelemetry {
    hits: DashMap<String, u64>,
    misses: DashMap<&'static str, u64>,
    stale: AtomicU64,
}

impl TriageTelemetry {
    /// Create a zeroed telemetry sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an affinity hit for `butler`.
    pub fn record_hit(&self, butler: &str) {
        *self.hits.entry(butler.to_owned()).or_insert(0) += 1;
    }

    /// Record an affinity miss with a low-cardinality reason tag.
    pub fn record_miss(&self, reason: &'static str) {
        *self.misses.entry(reason).or_insert(0) += 1;
    }

    /// Record a stale-history observation (also counted as a miss upstream).
    pub fn record_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
        self.record_miss("stale");
    }

    /// Current hit count for `butler`.
    #[must_use]
    pub fn hits(&self, butler: &str) -> u64 {
        self.hits.get(butler).map(|v| *v).unwrap_or(0)
    }

    /// Current miss count for `reason`.
    #[must_use]
    pub fn misses(&self, reason: &str) -> u64 {
        self.misses.get(reason).map(|v| *v).unwrap_or(0)
    }

    /// Current stale-history count.
    #[must_use]
    pub fn stale_count(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let t = TriageTelemetry::new();
        t.record_hit("finance");
        t.record_hit("finance");
        t.record_hit("health");
        t.record_miss("conflict");
        t.record_stale();

        assert_eq!(t.hits("finance"), 2);
        assert_eq!(t.hits("health"), 1);
        assert_eq!(t.hits("unknown"), 0);
        assert_eq!(t.misses("conflict"), 1);
        assert_eq!(t.misses("stale"), 1);
        assert_eq!(t.stale_count(), 1);
    }
}
