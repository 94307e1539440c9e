use std::future::Future;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use butlers_contracts::{
    ContractError, IngestEnvelope, RequestContext, RequestId, ROUTE_SCHEMA_VERSION, Timestamp,
    parse_ingest,
};
use butlers_registry::{DispatchResult, RouteOrigin, Router};
use butlers_triage::{
    AffinitySettings, Disposition, RoutingHistory, TriageDecision, TriageRule, TriageSummary,
    TriageTelemetry, evaluate, lookup_thread_affinity, sort_rules,
};

use crate::daemon::DaemonError;

/// Shared, reloadable cache of the active triage rules, kept in evaluation
/// order.
#[derive(Debug, Default)]
pub struct TriageRuleCache {
    rules: RwLock<Vec<TriageRule>>,
}

impl TriageRuleCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached rule set (sorted into evaluation order).
    pub fn replace(&self, mut rules: Vec<TriageRule>) {
        sort_rules(&mut rules);
        *self.rules.write().expect("rule cache lock poisoned") = rules;
    }

    /// Snapshot the current rules.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TriageRule> {
        self.rules.read().expect("rule cache lock poisoned").clone()
    }

    /// Reload the cache from the `triage_rules` table. Malformed rows are
    /// skipped with a warning; a bad rule must never take triage down.
    pub async fn reload_from_postgres(
        &self,
        pool: &PgPool,
        schema: &str,
    ) -> Result<usize, DaemonError> {
        let query = format!(
            "SELECT id, rule_type, condition, action, priority, created_at \
             FROM {schema}.triage_rules \
             ORDER BY priority, created_at, id"
        );
        let rows = sqlx::query(&query)
            .fetch_all(pool)
            .await
            .map_err(|e| DaemonError::Store(e.to_string()))?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.get("id");
            let rule_type: String = row.get("rule_type");
            let condition: Value = row.get("condition");
            let action: String = row.get("action");
            match TriageRule::from_stored(
                id,
                &rule_type,
                &condition,
                &action,
                row.get::<i32, _>("priority"),
                row.get("created_at"),
            ) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(rule_id = %id, error = %e, "skipping malformed triage rule"),
            }
        }
        let count = rules.len();
        self.replace(rules);
        Ok(count)
    }
}

/// Terminal outcome of one ingested event.
#[derive(Debug)]
pub enum IngestDisposition {
    /// Dropped by a skip rule.
    Skipped { decision: TriageDecision },
    /// Stored as metadata only; no routing.
    MetadataOnly { decision: TriageDecision },
    /// Queued at low priority; no immediate routing.
    LowPriority { decision: TriageDecision },
    /// Routed deterministically (rule or thread affinity).
    Routed {
        decision: TriageDecision,
        results: Vec<DispatchResult>,
    },
    /// No deterministic match; LLM classification chose the targets.
    PassedThrough {
        targets: Vec<String>,
        results: Vec<DispatchResult>,
    },
}

/// The Switchboard's ingest pipeline: contract validation, triage, and
/// routing to target butlers.
pub struct SwitchboardPipeline {
    rules: Arc<TriageRuleCache>,
    settings: RwLock<AffinitySettings>,
    history: Arc<dyn RoutingHistory>,
    telemetry: Arc<TriageTelemetry>,
    router: Arc<Router>,
    self_name: String,
}

impl SwitchboardPipeline {
    /// Assemble a pipeline.
    pub fn new(
        self_name: impl Into<String>,
        rules: Arc<TriageRuleCache>,
        history: Arc<dyn RoutingHistory>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            rules,
            settings: RwLock::new(AffinitySettings::defaults()),
            history,
            telemetry: Arc::new(TriageTelemetry::new()),
            router,
            self_name: self_name.into(),
        }
    }

    /// Replace the thread-affinity settings (operator tooling).
    pub fn set_affinity_settings(&self, settings: AffinitySettings) {
        *self.settings.write().expect("settings lock poisoned") = settings;
    }

    /// Triage counters.
    #[must_use]
    pub fn telemetry(&self) -> &Arc<TriageTelemetry> {
        &self.telemetry
    }

    /// Ingest one event: validate, triage, and route.
    ///
    /// `classify` is the LLM fallback used when no deterministic rule
    /// matches; it receives the normalized text and returns raw classifier
    /// output. Contract failures surface to the caller; everything after
    /// admission fails soft into the dispatch results.
    #[instrument(skip_all, fields(butler = %self.self_name))]
    pub async fn handle_ingest<F, Fut>(
        &self,
        payload: &Value,
        classify: F,
    ) -> Result<IngestDisposition, ContractError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, String>>,
    {
        let envelope = parse_ingest(payload)?;
        let summary = TriageSummary::from_ingest(&envelope);

        let affinity_target = {
            let settings = self
                .settings
                .read()
                .expect("settings lock poisoned")
                .clone();
            let result = lookup_thread_affinity(
                self.history.as_ref(),
                &settings,
                summary.thread_id.as_deref(),
                envelope.source.channel,
                &self.telemetry,
            )
            .await;
            result.target_butler
        };

        let decision = evaluate(&summary, &self.rules.snapshot(), affinity_target.as_deref());
        info!(
            disposition = %decision.disposition,
            target = decision.target_butler.as_deref().unwrap_or("-"),
            reason = %decision.reason,
            "triage decision"
        );

        match decision.disposition {
            Disposition::Skip => Ok(IngestDisposition::Skipped { decision }),
            Disposition::MetadataOnly => Ok(IngestDisposition::MetadataOnly { decision }),
            Disposition::LowPriorityQueue => Ok(IngestDisposition::LowPriority { decision }),
            Disposition::RouteTo => {
                let target = decision
                    .target_butler
                    .clone()
                    .expect("route_to decisions carry a target");
                let results = self.route_to_targets(&envelope, &[target]).await;
                Ok(IngestDisposition::Routed { decision, results })
            }
            Disposition::PassThrough => {
                let targets = self
                    .router
                    .classify_targets(envelope.payload.normalized_text.as_str(), classify)
                    .await;
                let results = self.route_to_targets(&envelope, &targets).await;
                Ok(IngestDisposition::PassedThrough { targets, results })
            }
        }
    }

    /// Derive a `route.v1` envelope from an accepted ingest envelope and
    /// dispatch it to each target's `route.execute` tool.
    async fn route_to_targets(
        &self,
        envelope: &IngestEnvelope,
        targets: &[String],
    ) -> Vec<DispatchResult> {
        let origin = RouteOrigin {
            butler: self.self_name.clone(),
            source_channel: Some(envelope.source.channel.as_str().to_owned()),
            thread_id: envelope
                .event
                .external_thread_id
                .as_ref()
                .map(|t| t.as_str().to_owned()),
        };

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let route_envelope = build_route_envelope(envelope);
            match self
                .router
                .route(target, "route.execute", &route_envelope, &origin)
                .await
            {
                Ok(value) => results.push(DispatchResult {
                    target: target.clone(),
                    result: Some(value),
                    error: None,
                }),
                Err(e) => results.push(DispatchResult {
                    target: target.clone(),
                    result: None,
                    error: Some(e.to_string()),
                }),
            }
        }
        results
    }
}

/// Build the routed envelope for one ingest event.
///
/// This is where lineage is born: a fresh v7 request id, the receive time,
/// and the source identity triple, all immutable from here on.
fn build_route_envelope(envelope: &IngestEnvelope) -> Value {
    let context = RequestContext {
        request_id: RequestId::generate(),
        received_at: Timestamp::from_datetime(chrono::Utc::now().fixed_offset()),
        source_channel: envelope.source.channel,
        source_endpoint_identity: envelope.source.endpoint_identity.clone(),
        source_sender_identity: envelope.sender.identity.clone(),
        source_thread_identity: envelope.event.external_thread_id.clone(),
        subrequest_id: None,
        segment_id: None,
        trace_context: envelope.control.trace_context.clone(),
    };

    serde_json::json!({
        "schema_version": ROUTE_SCHEMA_VERSION,
        "request_context": context,
        "input": {
            "prompt": envelope.payload.normalized_text,
        },
    })
}

/// Create the Switchboard-owned triage tables if they do not exist: the
/// rule table and the singleton affinity-settings row.
pub async fn migrate_switchboard_tables(pool: &PgPool, schema: &str) -> Result<(), DaemonError> {
    let statements = [
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.triage_rules (
                id UUID PRIMARY KEY,
                rule_type TEXT NOT NULL,
                condition JSONB NOT NULL,
                action TEXT NOT NULL,
                priority INT NOT NULL DEFAULT 100,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS triage_rules_order_idx \
             ON {schema}.triage_rules (priority, created_at, id)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.thread_affinity_settings (
                id INT PRIMARY KEY CHECK (id = 1),
                thread_affinity_enabled BOOLEAN NOT NULL DEFAULT TRUE,
                thread_affinity_ttl_days INT NOT NULL DEFAULT 30,
                thread_overrides JSONB NOT NULL DEFAULT '{{}}'::jsonb
            )"
        ),
        format!(
            "INSERT INTO {schema}.thread_affinity_settings (id) VALUES (1) \
             ON CONFLICT (id) DO NOTHING"
        ),
    ];
    for statement in &statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DaemonError::Store(e.to_string()))?;
    }
    Ok(())
}

/// Parse a stored affinity-settings row into [`AffinitySettings`].
pub fn affinity_settings_from_row(
    enabled: bool,
    ttl_days: i32,
    thread_overrides: &Value,
) -> AffinitySettings {
    let overrides = thread_overrides
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default();
    AffinitySettings {
        enabled,
        ttl_days: u32::try_from(ttl_days).unwrap_or(30),
        thread_overrides: overrides,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use butlers_registry::{
        AffinityHistory, ButlerRegistration, ButlerTransport, MemoryRegistry, MemoryRoutingLog,
        RegistryStore, RoutingLogEntry, RoutingLogStore, TransportError,
    };

    use super::*;

    struct CapturingTransport {
        calls: std::sync::Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl ButlerTransport for CapturingTransport {
        async fn call_tool(
            &self,
            endpoint_url: &str,
            tool: &str,
            args: &Value,
        ) -> Result<Value, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((format!("{endpoint_url}/{tool}"), args.clone()));
            Ok(json!({"status": "accepted", "row_id": Uuid::now_v7().to_string()}))
        }
    }

    async fn pipeline() -> (
        SwitchboardPipeline,
        Arc<CapturingTransport>,
        Arc<MemoryRoutingLog>,
    ) {
        let registry = Arc::new(MemoryRegistry::new());
        for name in ["finance", "health", "general"] {
            registry
                .register(ButlerRegistration::new(
                    name,
                    format!("http://localhost:40{name_len}/sse", name_len = name.len()),
                ))
                .await
                .unwrap();
        }
        let log = Arc::new(MemoryRoutingLog::new());
        let transport = Arc::new(CapturingTransport {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let router = Arc::new(Router::new(
            "switchboard",
            registry,
            Arc::clone(&log) as _,
            Arc::clone(&transport) as _,
        ));
        let rules = Arc::new(TriageRuleCache::new());
        let history = Arc::new(AffinityHistory(Arc::clone(&log) as _));
        (
            SwitchboardPipeline::new("switchboard", rules, history, router),
            transport,
            log,
        )
    }

    fn email_payload(sender: &str, thread_id: Option<&str>) -> Value {
        let mut event = json!({
            "external_event_id": "msg-1",
            "observed_at": "2026-02-18T10:00:00Z"
        });
        if let Some(t) = thread_id {
            event["external_thread_id"] = json!(t);
        }
        json!({
            "schema_version": "ingest.v1",
            "source": {"channel": "email", "provider": "imap", "endpoint_identity": "in@x.com"},
            "event": event,
            "sender": {"identity": sender},
            "payload": {"raw": {}, "normalized_text": "Your statement is ready."}
        })
    }

    fn finance_rule() -> TriageRule {
        TriageRule::from_stored(
            Uuid::now_v7(),
            "sender_domain",
            &json!({"domain": "chase.com", "match": "suffix"}),
            "route_to:finance",
            10,
            chrono::Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn domain_rule_routes_to_finance() {
        let (pipeline, transport, _) = pipeline().await;
        pipeline.rules.replace(vec![finance_rule()]);

        let disposition = pipeline
            .handle_ingest(&email_payload("alerts@chase.com", None), |_| async {
                panic!("deterministic match must not reach the classifier")
            })
            .await
            .unwrap();

        let IngestDisposition::Routed { decision, results } = disposition else {
            panic!("expected a routed disposition");
        };
        assert_eq!(decision.target_butler.as_deref(), Some("finance"));
        assert_eq!(decision.matched_rule_type, Some("sender_domain"));
        assert_eq!(results.len(), 1);
        assert!(results[0].error.is_none());

        // The routed envelope is a valid route.v1 with fresh lineage.
        let calls = transport.calls.lock().unwrap();
        let (_, envelope) = &calls[0];
        let parsed = butlers_contracts::parse_route(envelope).unwrap();
        assert_eq!(
            parsed.request_context.source_sender_identity.as_str(),
            "alerts@chase.com"
        );
        assert_eq!(parsed.input.prompt.as_str(), "Your statement is ready.");
    }

    #[tokio::test]
    async fn thread_affinity_bypasses_rules() {
        let (pipeline, _, log) = pipeline().await;
        pipeline.rules.replace(vec![finance_rule()]);
        // Prior routing history pins the thread to health.
        log.append(
            RoutingLogEntry::success("switchboard", "health", "route.execute", 5)
                .with_source(Some("email".into()), Some("t1".into())),
        )
        .await
        .unwrap();

        let disposition = pipeline
            .handle_ingest(&email_payload("alerts@chase.com", Some("t1")), |_| async {
                panic!("affinity hit must not reach the classifier")
            })
            .await
            .unwrap();

        let IngestDisposition::Routed { decision, .. } = disposition else {
            panic!("expected a routed disposition");
        };
        assert_eq!(decision.target_butler.as_deref(), Some("health"));
        assert_eq!(decision.matched_rule_type, Some("thread_affinity"));
        assert_eq!(pipeline.telemetry().hits("health"), 1);
    }

    #[tokio::test]
    async fn skip_rule_drops_the_event() {
        let (pipeline, transport, _) = pipeline().await;
        pipeline.rules.replace(vec![
            TriageRule::from_stored(
                Uuid::now_v7(),
                "sender_address",
                &json!({"address": "noreply@spam.example"}),
                "skip",
                1,
                chrono::Utc::now(),
            )
            .unwrap(),
        ]);

        let disposition = pipeline
            .handle_ingest(&email_payload("noreply@spam.example", None), |_| async {
                panic!("skipped events must not reach the classifier")
            })
            .await
            .unwrap();
        assert!(matches!(disposition, IngestDisposition::Skipped { .. }));
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pass_through_classifies_and_fans_out() {
        let (pipeline, transport, _) = pipeline().await;

        let disposition = pipeline
            .handle_ingest(&email_payload("friend@example.org", None), |_| async {
                Ok("finance, health".to_owned())
            })
            .await
            .unwrap();

        let IngestDisposition::PassedThrough { targets, results } = disposition else {
            panic!("expected pass-through");
        };
        assert_eq!(targets, vec!["finance", "health"]);
        assert_eq!(results.len(), 2);
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn classifier_failure_falls_back_to_general() {
        let (pipeline, _, _) = pipeline().await;
        let disposition = pipeline
            .handle_ingest(&email_payload("friend@example.org", None), |_| async {
                Err("llm down".to_owned())
            })
            .await
            .unwrap();
        let IngestDisposition::PassedThrough { targets, .. } = disposition else {
            panic!("expected pass-through");
        };
        assert_eq!(targets, vec!["general"]);
    }

    #[tokio::test]
    async fn contract_failures_surface_to_the_caller() {
        let (pipeline, _, _) = pipeline().await;
        let err = pipeline
            .handle_ingest(&json!({"schema_version": "ingest.v2"}), |_| async {
                Ok(String::new())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "unsupported_schema_version");
    }

    #[tokio::test]
    async fn unreachable_target_is_a_soft_failure() {
        // No registry entry for the routed target.
        let registry = Arc::new(MemoryRegistry::new());
        let log = Arc::new(MemoryRoutingLog::new());
        let transport = Arc::new(CapturingTransport {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let router = Arc::new(Router::new(
            "switchboard",
            registry,
            Arc::clone(&log) as _,
            transport as _,
        ));
        let rules = Arc::new(TriageRuleCache::new());
        rules.replace(vec![finance_rule()]);
        let history = Arc::new(AffinityHistory(Arc::clone(&log) as _));
        let pipeline = SwitchboardPipeline::new("switchboard", rules, history, router);

        let disposition = pipeline
            .handle_ingest(&email_payload("alerts@chase.com", None), |_| async {
                Ok(String::new())
            })
            .await
            .unwrap();
        let IngestDisposition::Routed { results, .. } = disposition else {
            panic!("expected routed");
        };
        assert!(results[0].error.as_deref().unwrap().contains("not found"));
    }
}
