use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;

use butlers_contracts::HeartbeatCounters;

/// Latency histogram bucket upper bounds, in seconds.
const LATENCY_BUCKETS: [f64; 10] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    overflow: AtomicU64,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    fn observe(&self, seconds: f64) {
        match LATENCY_BUCKETS.iter().position(|&bound| seconds <= bound) {
            Some(idx) => self.buckets[idx].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cumulative per-connector counters.
///
/// Labels are the connector's identity tuple plus low-cardinality
/// dimensions: ingest status (`success`/`error`/`duplicate`), API method and
/// status, checkpoint status, and error type/operation.
#[derive(Debug)]
pub struct ConnectorMetrics {
    connector_type: String,
    endpoint_identity: String,
    ingest_submissions: DashMap<String, u64>,
    ingest_latency: LatencyHistogram,
    source_api_calls: DashMap<(String, String), u64>,
    checkpoint_saves: DashMap<String, u64>,
    errors: DashMap<(String, String), u64>,
}

impl ConnectorMetrics {
    /// Metrics for one connector instance.
    #[must_use]
    pub fn new(connector_type: impl Into<String>, endpoint_identity: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            endpoint_identity: endpoint_identity.into(),
            ingest_submissions: DashMap::new(),
            ingest_latency: LatencyHistogram::default(),
            source_api_calls: DashMap::new(),
            checkpoint_saves: DashMap::new(),
            errors: DashMap::new(),
        }
    }

    /// The connector type these metrics belong to.
    #[must_use]
    pub fn connector_type(&self) -> &str {
        &self.connector_type
    }

    /// The endpoint identity these metrics belong to.
    #[must_use]
    pub fn endpoint_identity(&self) -> &str {
        &self.endpoint_identity
    }

    /// Start tracking one ingest submission.
    ///
    /// The returned tracker records latency and the final status counter
    /// when dropped -- including on early return or panic -- defaulting to
    /// `error` unless a status was set.
    #[must_use]
    pub fn track_ingest_submission(&self) -> IngestTracker<'_> {
        IngestTracker {
            metrics: self,
            started: Instant::now(),
            status: None,
        }
    }

    fn record_ingest(&self, status: &str, seconds: f64) {
        *self
            .ingest_submissions
            .entry(status.to_owned())
            .or_insert(0) += 1;
        self.ingest_latency.observe(seconds);
    }

    /// Count one provider API call.
    pub fn record_source_api_call(&self, api_method: &str, status: &str) {
        *self
            .source_api_calls
            .entry((api_method.to_owned(), status.to_owned()))
            .or_insert(0) += 1;
    }

    /// Count one checkpoint save.
    pub fn record_checkpoint_save(&self, status: &str) {
        *self
            .checkpoint_saves
            .entry(status.to_owned())
            .or_insert(0) += 1;
    }

    /// Count one error by type and operation.
    pub fn record_error(&self, error_type: &str, operation: &str) {
        *self
            .errors
            .entry((error_type.to_owned(), operation.to_owned()))
            .or_insert(0) += 1;
    }

    fn ingest_count(&self, status: &str) -> u64 {
        self.ingest_submissions.get(status).map(|v| *v).unwrap_or(0)
    }

    /// Snapshot the counters the heartbeat envelope reports.
    #[must_use]
    pub fn counters_snapshot(&self) -> HeartbeatCounters {
        HeartbeatCounters {
            messages_ingested: self.ingest_count("success"),
            messages_failed: self.ingest_count("error"),
            dedupe_accepted: self.ingest_count("duplicate"),
            source_api_calls: self.source_api_calls.iter().map(|e| *e.value()).sum(),
            checkpoint_saves: self
                .checkpoint_saves
                .get("success")
                .map(|v| *v)
                .unwrap_or(0),
        }
    }

    /// Total latency observations (for tests and debugging).
    #[must_use]
    pub fn latency_observations(&self) -> u64 {
        self.ingest_latency.count.load(Ordering::Relaxed)
    }
}

/// Drop guard for one tracked ingest submission.
pub struct IngestTracker<'a> {
    metrics: &'a ConnectorMetrics,
    started: Instant,
    status: Option<&'static str>,
}

impl IngestTracker<'_> {
    /// Mark this submission successful.
    pub fn success(&mut self) {
        self.status = Some("success");
    }

    /// Mark this submission as a deduplicated accept.
    pub fn duplicate(&mut self) {
        self.status = Some("duplicate");
    }

    /// Mark this submission failed (also the default on drop).
    pub fn error(&mut self) {
        self.status = Some("error");
    }
}

impl Drop for IngestTracker<'_> {
    fn drop(&mut self) {
        let seconds = self.started.elapsed().as_secs_f64();
        self.metrics
            .record_ingest(self.status.unwrap_or("error"), seconds);
    }
}
