use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

use crate::record::{ButlerRecord, ButlerRegistration, EligibilityState};
use crate::routing_log::{RoutingLogEntry, RoutingLogStore};
use crate::store::{RegistryError, RegistryStore};

/// In-memory [`RegistryStore`] for tests and development.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: DashMap<String, ButlerRecord>,
}

impl MemoryRegistry {
    /// Create a new, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn register(&self, registration: ButlerRegistration) -> Result<(), RegistryError> {
        let now = Utc::now();
        match self.records.entry(registration.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.endpoint_url = registration.endpoint_url;
                record.description = registration.description;
                record.modules = registration.modules;
                record.capabilities = registration.capabilities;
                record.route_contract_min = registration.route_contract_min;
                record.route_contract_max = registration.route_contract_max;
                record.liveness_ttl_seconds = registration.liveness_ttl_seconds;
                record.last_seen_at = Some(now);
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ButlerRecord {
                    name: registration.name,
                    endpoint_url: registration.endpoint_url,
                    description: registration.description,
                    modules: registration.modules,
                    capabilities: registration.capabilities,
                    route_contract_min: registration.route_contract_min,
                    route_contract_max: registration.route_contract_max,
                    eligibility_state: EligibilityState::Active,
                    liveness_ttl_seconds: registration.liveness_ttl_seconds,
                    last_seen_at: Some(now),
                    quarantined_at: None,
                    quarantine_reason: None,
                    registered_at: now,
                });
            }
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<ButlerRecord>, RegistryError> {
        Ok(self.records.get(name).map(|r| r.clone()))
    }

    async fn list(&self) -> Result<Vec<ButlerRecord>, RegistryError> {
        let mut records: Vec<ButlerRecord> =
            self.records.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn mark_seen(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self.records.get_mut(name).map_or(false, |mut r| {
            r.last_seen_at = Some(Utc::now());
            true
        }))
    }

    async fn quarantine(&self, name: &str, reason: &str) -> Result<bool, RegistryError> {
        Ok(self.records.get_mut(name).map_or(false, |mut r| {
            r.eligibility_state = EligibilityState::Quarantined;
            r.quarantined_at = Some(Utc::now());
            r.quarantine_reason = Some(reason.to_owned());
            true
        }))
    }

    async fn clear_quarantine(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self.records.get_mut(name).map_or(false, |mut r| {
            r.eligibility_state = EligibilityState::Active;
            r.quarantined_at = None;
            r.quarantine_reason = None;
            true
        }))
    }

    async fn set_draining(&self, name: &str) -> Result<bool, RegistryError> {
        Ok(self.records.get_mut(name).map_or(false, |mut r| {
            r.eligibility_state = EligibilityState::Draining;
            true
        }))
    }
}

/// In-memory [`RoutingLogStore`].
#[derive(Debug, Default)]
pub struct MemoryRoutingLog {
    entries: Mutex<Vec<RoutingLogEntry>>,
}

impl MemoryRoutingLog {
    /// Create a new, empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, in append order.
    #[must_use]
    pub fn entries(&self) -> Vec<RoutingLogEntry> {
        self.entries.lock().expect("log mutex poisoned").clone()
    }
}

#[async_trait]
impl RoutingLogStore for MemoryRoutingLog {
    async fn append(&self, entry: RoutingLogEntry) -> Result<(), RegistryError> {
        self.entries.lock().expect("log mutex poisoned").push(entry);
        Ok(())
    }

    async fn recent_thread_targets(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<Vec<String>, RegistryError> {
        let cutoff = Utc::now() - Duration::days(i64::from(ttl_days));
        let entries = self.entries.lock().expect("log mutex poisoned");
        let mut matching: Vec<&RoutingLogEntry> = entries
            .iter()
            .filter(|e| {
                e.source_channel.as_deref() == Some("email")
                    && e.thread_id.as_deref() == Some(thread_id)
                    && e.created_at >= cutoff
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut targets = Vec::new();
        for entry in matching {
            if !targets.contains(&entry.target_butler) {
                targets.push(entry.target_butler.clone());
            }
            if targets.len() >= 2 {
                break;
            }
        }
        Ok(targets)
    }

    async fn has_stale_thread_history(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<bool, RegistryError> {
        let cutoff = Utc::now() - Duration::days(i64::from(ttl_days));
        let entries = self.entries.lock().expect("log mutex poisoned");
        Ok(entries.iter().any(|e| {
            e.source_channel.as_deref() == Some("email")
                && e.thread_id.as_deref() == Some(thread_id)
                && e.created_at < cutoff
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::router::{RouteOrigin, Router};
    use crate::store::RoutingError;
    use crate::transport::{ButlerTransport, TransportError};

    /// Transport double that returns a canned response or error.
    struct FakeTransport {
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeTransport {
        fn ok() -> Self {
            Self {
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ButlerTransport for FakeTransport {
        async fn call_tool(
            &self,
            _endpoint_url: &str,
            tool: &str,
            _args: &Value,
        ) -> Result<Value, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TransportError::Connection("connection refused".into()))
            } else {
                Ok(json!({"status": "ok", "tool": tool}))
            }
        }
    }

    async fn registry_with(name: &str, modules: Vec<String>) -> Arc<MemoryRegistry> {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register(
                ButlerRegistration::new(name, format!("http://localhost:4010/{name}"))
                    .with_modules(modules),
            )
            .await
            .unwrap();
        registry
    }

    fn router(
        registry: Arc<MemoryRegistry>,
        log: Arc<MemoryRoutingLog>,
        transport: Arc<dyn ButlerTransport>,
    ) -> Router {
        Router::new("switchboard", registry, log, transport)
    }

    #[tokio::test]
    async fn route_success_records_log_entry() {
        let registry = registry_with("health", vec![]).await;
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(registry, Arc::clone(&log), Arc::new(FakeTransport::ok()));

        let origin = RouteOrigin {
            butler: "switchboard".into(),
            source_channel: Some("email".into()),
            thread_id: Some("t1".into()),
        };
        let result = r
            .route("health", "route.execute", &json!({}), &origin)
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].target_butler, "health");
        assert_eq!(entries[0].thread_id.as_deref(), Some("t1"));
        assert!(entries[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn route_to_unknown_butler_fails() {
        let registry = Arc::new(MemoryRegistry::new());
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(registry, log, Arc::new(FakeTransport::ok()));

        let err = r
            .route("ghost", "tick", &json!({}), &RouteOrigin::butler("switchboard"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::ButlerNotFound(_)));
    }

    #[tokio::test]
    async fn quarantined_butler_is_not_routable() {
        let registry = registry_with("health", vec![]).await;
        registry.quarantine("health", "flapping").await.unwrap();
        let log = Arc::new(MemoryRoutingLog::new());
        let transport = Arc::new(FakeTransport::ok());
        let r = router(registry, Arc::clone(&log), Arc::clone(&transport) as _);

        let err = r
            .route("health", "tick", &json!({}), &RouteOrigin::butler("switchboard"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::ButlerIneligible { .. }));
        // The transport was never touched; the failure is still logged.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(log.entries().len(), 1);
        assert!(!log.entries()[0].success);
    }

    #[tokio::test]
    async fn unreachable_butler_logs_failure() {
        let registry = registry_with("health", vec![]).await;
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(registry, Arc::clone(&log), Arc::new(FakeTransport::failing()));

        let err = r
            .route("health", "tick", &json!({}), &RouteOrigin::butler("switchboard"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::ButlerUnreachable { .. }));
        assert!(!log.entries()[0].success);
        assert!(log.entries()[0].error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn post_mail_requires_mailbox_module() {
        let registry = registry_with("health", vec![]).await;
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(
            Arc::clone(&registry),
            Arc::clone(&log),
            Arc::new(FakeTransport::ok()),
        );

        let err = r
            .post_mail("health", "finance", "internal", "hello", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::MailboxNotEnabled(_)));

        let registry = registry_with("memory", vec!["mailbox".into()]).await;
        let r = router(registry, log, Arc::new(FakeTransport::ok()));
        let result = r
            .post_mail(
                "memory",
                "finance",
                "internal",
                "monthly summary attached",
                Some("summary"),
                Some("normal"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(result["tool"], "mailbox_post");
    }

    #[tokio::test]
    async fn classify_falls_back_to_general() {
        let registry = Arc::new(MemoryRegistry::new());
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(registry, log, Arc::new(FakeTransport::ok()));

        let targets = r
            .classify_targets("what's my balance", |_| async {
                Ok("finance, general".to_owned())
            })
            .await;
        assert_eq!(targets, vec!["finance", "general"]);

        let targets = r
            .classify_targets("hello", |_| async { Err("llm down".to_owned()) })
            .await;
        assert_eq!(targets, vec!["general"]);

        let targets = r
            .classify_targets("hello", |_| async { Ok("   ".to_owned()) })
            .await;
        assert_eq!(targets, vec!["general"]);
    }

    #[tokio::test]
    async fn dispatch_records_partial_failures() {
        let registry = Arc::new(MemoryRegistry::new());
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(registry, log, Arc::new(FakeTransport::ok()));

        let targets = vec!["finance".to_owned(), "health".to_owned()];
        let results = r
            .dispatch_to_targets(&targets, "hi", |target, _| async move {
                if target == "health" {
                    Err("unreachable".to_owned())
                } else {
                    Ok(json!("ok"))
                }
            })
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].result.is_some());
        assert_eq!(results[1].error.as_deref(), Some("unreachable"));
    }

    #[tokio::test]
    async fn tick_all_skips_self() {
        let registry = Arc::new(MemoryRegistry::new());
        for name in ["switchboard", "health", "finance"] {
            registry
                .register(ButlerRegistration::new(name, "http://localhost:1/x"))
                .await
                .unwrap();
        }
        let log = Arc::new(MemoryRoutingLog::new());
        let r = router(registry, log, Arc::new(FakeTransport::ok()));

        let summary = r
            .tick_all_butlers(|name| async move {
                if name == "finance" {
                    Err("tick failed".to_owned())
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].name, "finance");
    }

    #[tokio::test]
    async fn routing_log_feeds_thread_affinity() {
        use butlers_triage::{
            AffinityOutcome, AffinitySettings, RoutingHistory, TriageTelemetry,
            lookup_thread_affinity,
        };

        let log = Arc::new(MemoryRoutingLog::new());
        log.append(
            RoutingLogEntry::success("switchboard", "health", "route.execute", 12)
                .with_source(Some("email".into()), Some("t1".into())),
        )
        .await
        .unwrap();

        let history = crate::routing_log::AffinityHistory(Arc::clone(&log) as _);
        assert_eq!(
            history.recent_targets("t1", 30).await.unwrap(),
            vec!["health"]
        );

        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            butlers_triage::SourceChannel::Email,
            &TriageTelemetry::new(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::Hit);
        assert_eq!(result.target_butler.as_deref(), Some("health"));
    }
}
