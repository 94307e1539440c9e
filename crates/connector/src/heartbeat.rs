use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use butlers_contracts::{
    HEARTBEAT_SCHEMA_VERSION, HeartbeatCheckpoint, HeartbeatConnector, HeartbeatEnvelope,
    HeartbeatStatus, NonEmptyString, Timestamp,
};

use crate::metrics::ConnectorMetrics;
use crate::{DEFAULT_HEARTBEAT_INTERVAL_S, MAX_HEARTBEAT_INTERVAL_S, MIN_HEARTBEAT_INTERVAL_S};

/// Callback returning the connector's self-reported `(state, error)`.
pub type HealthStateFn = Arc<dyn Fn() -> (String, Option<String>) + Send + Sync>;

/// Callback returning the connector's `(cursor, updated_at)` checkpoint.
pub type CheckpointFn = Arc<dyn Fn() -> (Option<String>, Option<DateTime<Utc>>) + Send + Sync>;

/// Configuration for the heartbeat task.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub connector_type: String,
    pub endpoint_identity: String,
    pub version: Option<String>,
    pub interval: Duration,
    pub enabled: bool,
}

impl HeartbeatConfig {
    /// Config with the default two-minute interval.
    #[must_use]
    pub fn new(connector_type: impl Into<String>, endpoint_identity: impl Into<String>) -> Self {
        Self {
            connector_type: connector_type.into(),
            endpoint_identity: endpoint_identity.into(),
            version: None,
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_S),
            enabled: true,
        }
    }

    /// Read interval and enablement from the environment.
    ///
    /// `CONNECTOR_HEARTBEAT_INTERVAL_S` is clamped to 30–300 seconds;
    /// `CONNECTOR_HEARTBEAT_ENABLED` accepts the usual false spellings.
    #[must_use]
    pub fn from_env(
        connector_type: impl Into<String>,
        endpoint_identity: impl Into<String>,
        version: Option<String>,
    ) -> Self {
        let interval_s = clamp_interval_secs(
            std::env::var("CONNECTOR_HEARTBEAT_INTERVAL_S")
                .ok()
                .and_then(|v| v.parse::<u64>().ok()),
        );
        let enabled = std::env::var("CONNECTOR_HEARTBEAT_ENABLED")
            .map(|v| parse_enabled_flag(&v))
            .unwrap_or(true);

        Self {
            connector_type: connector_type.into(),
            endpoint_identity: endpoint_identity.into(),
            version,
            interval: Duration::from_secs(interval_s),
            enabled,
        }
    }
}

/// Clamp a configured interval into the allowed 30–300 s range; absent or
/// unparseable values fall back to the default.
fn clamp_interval_secs(configured: Option<u64>) -> u64 {
    let interval_s = configured.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_S);
    if interval_s < MIN_HEARTBEAT_INTERVAL_S {
        warn!(
            interval_s,
            minimum = MIN_HEARTBEAT_INTERVAL_S,
            "heartbeat interval below minimum; clamping"
        );
        MIN_HEARTBEAT_INTERVAL_S
    } else if interval_s > MAX_HEARTBEAT_INTERVAL_S {
        warn!(
            interval_s,
            maximum = MAX_HEARTBEAT_INTERVAL_S,
            "heartbeat interval above maximum; clamping"
        );
        MAX_HEARTBEAT_INTERVAL_S
    } else {
        interval_s
    }
}

/// Interpret an enable flag; anything but the usual false spellings is on.
fn parse_enabled_flag(value: &str) -> bool {
    !matches!(value.to_lowercase().as_str(), "false" | "0" | "no" | "off")
}

/// Where heartbeat envelopes go -- in production, the Switchboard's
/// `connector.heartbeat` MCP tool.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Submit one envelope; the response is the tool's JSON result.
    async fn submit(&self, envelope: &HeartbeatEnvelope) -> Result<Value, String>;
}

/// Sink that records envelopes in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    envelopes: std::sync::Mutex<Vec<HeartbeatEnvelope>>,
    /// When set, every submit fails with this message.
    pub fail_with: Option<String>,
}

impl RecordingSink {
    /// A sink accepting everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All envelopes received so far.
    #[must_use]
    pub fn envelopes(&self) -> Vec<HeartbeatEnvelope> {
        self.envelopes.lock().expect("sink mutex poisoned").clone()
    }
}

#[async_trait]
impl HeartbeatSink for RecordingSink {
    async fn submit(&self, envelope: &HeartbeatEnvelope) -> Result<Value, String> {
        if let Some(ref message) = self.fail_with {
            return Err(message.clone());
        }
        self.envelopes
            .lock()
            .expect("sink mutex poisoned")
            .push(envelope.clone());
        Ok(serde_json::json!({"status": "accepted"}))
    }
}

/// Periodic liveness reporter for one connector process.
///
/// Generates a stable `instance_id` at construction; the background loop
/// wakes every `interval`, snapshots counters, and submits one envelope.
/// Submission failures are logged, never raised, and cancellation stops the
/// loop cleanly.
pub struct Heartbeat {
    config: HeartbeatConfig,
    sink: Arc<dyn HeartbeatSink>,
    metrics: Arc<ConnectorMetrics>,
    get_health_state: HealthStateFn,
    get_checkpoint: Option<CheckpointFn>,
    instance_id: Uuid,
    started: Instant,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Build a heartbeat task (not yet running).
    pub fn new(
        config: HeartbeatConfig,
        sink: Arc<dyn HeartbeatSink>,
        metrics: Arc<ConnectorMetrics>,
        get_health_state: HealthStateFn,
        get_checkpoint: Option<CheckpointFn>,
    ) -> Arc<Self> {
        let heartbeat = Arc::new(Self {
            config,
            sink,
            metrics,
            get_health_state,
            get_checkpoint,
            instance_id: Uuid::new_v4(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        });
        info!(
            connector_type = %heartbeat.config.connector_type,
            endpoint_identity = %heartbeat.config.endpoint_identity,
            instance_id = %heartbeat.instance_id,
            interval_s = heartbeat.config.interval.as_secs(),
            enabled = heartbeat.config.enabled,
            "initialized heartbeat"
        );
        heartbeat
    }

    /// Stable instance id for this process lifetime.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Start the background loop. A disabled config is a no-op; starting
    /// twice is a warning.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!(
                connector_type = %self.config.connector_type,
                "heartbeat disabled via configuration"
            );
            return;
        }
        let mut task = self.task.lock().expect("heartbeat task mutex poisoned");
        if task.is_some() {
            warn!("heartbeat task already running");
            return;
        }

        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(this.config.interval) => {}
                    () = this.cancel.cancelled() => {
                        debug!("heartbeat loop cancelled");
                        return;
                    }
                }
                this.send_heartbeat().await;
            }
        }));
        info!(
            connector_type = %self.config.connector_type,
            endpoint_identity = %self.config.endpoint_identity,
            "started heartbeat task"
        );
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .expect("heartbeat task mutex poisoned")
            .take();
        if let Some(handle) = task {
            let _ = handle.await;
            info!(
                connector_type = %self.config.connector_type,
                "heartbeat task stopped"
            );
        }
    }

    /// Build and submit one heartbeat. All failures are swallowed.
    pub async fn send_heartbeat(&self) {
        let Some(envelope) = self.build_envelope() else {
            warn!("heartbeat identity fields are empty; skipping submission");
            return;
        };

        match self.sink.submit(&envelope).await {
            Ok(response) => {
                if response.get("status").and_then(Value::as_str) == Some("accepted") {
                    debug!(
                        instance_id = %self.instance_id,
                        uptime_s = envelope.status.uptime_s,
                        "heartbeat accepted"
                    );
                } else {
                    warn!(?response, "unexpected heartbeat response");
                }
            }
            Err(e) => {
                // Never raise: liveness reporting must not block ingestion.
                warn!(error = %e, "failed to submit heartbeat");
            }
        }
    }

    fn build_envelope(&self) -> Option<HeartbeatEnvelope> {
        let (state, error_message) = (self.get_health_state)();
        let checkpoint = self.get_checkpoint.as_ref().and_then(|get| {
            let (cursor, updated_at) = get();
            if cursor.is_none() && updated_at.is_none() {
                None
            } else {
                Some(HeartbeatCheckpoint {
                    cursor,
                    updated_at: updated_at
                        .map(|at| Timestamp::from_datetime(at.fixed_offset())),
                })
            }
        });

        Some(HeartbeatEnvelope {
            schema_version: HEARTBEAT_SCHEMA_VERSION.to_owned(),
            connector: HeartbeatConnector {
                connector_type: NonEmptyString::new(&self.config.connector_type)?,
                endpoint_identity: NonEmptyString::new(&self.config.endpoint_identity)?,
                instance_id: self.instance_id,
                version: self
                    .config
                    .version
                    .as_deref()
                    .and_then(|v| NonEmptyString::new(v)),
            },
            status: HeartbeatStatus {
                state: NonEmptyString::new(state)?,
                error_message,
                uptime_s: self.started.elapsed().as_secs(),
            },
            counters: self.metrics.counters_snapshot(),
            checkpoint,
            sent_at: Timestamp::from_datetime(Utc::now().fixed_offset()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health_ok() -> HealthStateFn {
        Arc::new(|| ("healthy".to_owned(), None))
    }

    fn heartbeat_with_sink(sink: Arc<RecordingSink>) -> Arc<Heartbeat> {
        let metrics = Arc::new(ConnectorMetrics::new("gmail", "inbox@example.com"));
        {
            let mut t = metrics.track_ingest_submission();
            t.success();
        }
        Heartbeat::new(
            HeartbeatConfig::new("gmail", "inbox@example.com"),
            sink,
            metrics,
            health_ok(),
            Some(Arc::new(|| {
                (Some("history-42".to_owned()), Some(Utc::now()))
            })),
        )
    }

    #[tokio::test]
    async fn envelope_carries_identity_counters_and_checkpoint() {
        let sink = Arc::new(RecordingSink::new());
        let heartbeat = heartbeat_with_sink(Arc::clone(&sink));

        heartbeat.send_heartbeat().await;

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        let envelope = &envelopes[0];
        assert_eq!(envelope.schema_version, "connector.heartbeat.v1");
        assert_eq!(envelope.connector.connector_type.as_str(), "gmail");
        assert_eq!(envelope.connector.instance_id, heartbeat.instance_id());
        assert_eq!(envelope.status.state.as_str(), "healthy");
        assert_eq!(envelope.counters.messages_ingested, 1);
        assert_eq!(
            envelope.checkpoint.as_ref().unwrap().cursor.as_deref(),
            Some("history-42")
        );

        // The envelope round-trips through its own contract parser.
        let as_json = serde_json::to_value(envelope).unwrap();
        assert!(butlers_contracts::parse_heartbeat(&as_json).is_ok());
    }

    #[tokio::test]
    async fn submission_failure_never_raises() {
        let sink = Arc::new(RecordingSink {
            fail_with: Some("switchboard unavailable".into()),
            ..RecordingSink::default()
        });
        let heartbeat = heartbeat_with_sink(Arc::clone(&sink));

        // Just logs; returns normally.
        heartbeat.send_heartbeat().await;
        assert!(sink.envelopes().is_empty());
    }

    // Env-driven construction itself is not exercised here: reading real
    // process env in tests would require mutating it, which needs `unsafe`
    // in Rust 2024. The parsing and clamping it delegates to is covered
    // below.
    #[test]
    fn interval_clamping() {
        assert_eq!(clamp_interval_secs(Some(5)), 30);
        assert_eq!(clamp_interval_secs(Some(900)), 300);
        assert_eq!(clamp_interval_secs(Some(120)), 120);
        assert_eq!(clamp_interval_secs(Some(30)), 30);
        assert_eq!(clamp_interval_secs(Some(300)), 300);
        assert_eq!(clamp_interval_secs(None), 120);
    }

    #[test]
    fn enabled_flag_spellings() {
        for off in ["false", "FALSE", "0", "no", "off"] {
            assert!(!parse_enabled_flag(off));
        }
        for on in ["true", "1", "yes", "anything"] {
            assert!(parse_enabled_flag(on));
        }
    }

    #[tokio::test]
    async fn start_and_stop_are_clean() {
        let sink = Arc::new(RecordingSink::new());
        let heartbeat = heartbeat_with_sink(Arc::clone(&sink));
        heartbeat.start();
        // Cancel before the first (two-minute) tick fires.
        heartbeat.stop().await;
        assert!(sink.envelopes().is_empty());
    }

    #[tokio::test]
    async fn disabled_heartbeat_never_spawns() {
        let metrics = Arc::new(ConnectorMetrics::new("gmail", "inbox@example.com"));
        let sink = Arc::new(RecordingSink::new());
        let mut config = HeartbeatConfig::new("gmail", "inbox@example.com");
        config.enabled = false;
        let heartbeat = Heartbeat::new(config, sink, metrics, health_ok(), None);
        heartbeat.start();
        assert!(
            heartbeat
                .task
                .lock()
                .expect("heartbeat task mutex poisoned")
                .is_none()
        );
        heartbeat.stop().await;
    }
}
