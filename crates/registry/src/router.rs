use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::record::EligibilityState;
use crate::routing_log::{RoutingLogEntry, RoutingLogStore};
use crate::store::{RegistryStore, RoutingError};
use crate::transport::ButlerTransport;

/// Fallback classification target when the LLM yields nothing usable.
const FALLBACK_TARGET: &str = "general";

/// Who is routing, and on behalf of which channel/thread (for the log).
#[derive(Debug, Clone, Default)]
pub struct RouteOrigin {
    pub butler: String,
    pub source_channel: Option<String>,
    pub thread_id: Option<String>,
}

impl RouteOrigin {
    /// Origin with just the source butler name.
    #[must_use]
    pub fn butler(name: impl Into<String>) -> Self {
        Self {
            butler: name.into(),
            ..Self::default()
        }
    }
}

/// Per-target outcome of a fan-out dispatch.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub target: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// One failed tick in a fleet-wide heartbeat round.
#[derive(Debug, Clone)]
pub struct TickFailure {
    pub name: String,
    pub error: String,
}

/// Summary of a fleet-wide heartbeat round.
#[derive(Debug, Clone)]
pub struct TickSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: Vec<TickFailure>,
}

/// Routing facade over the registry, the routing log, and the transport.
pub struct Router {
    registry: Arc<dyn RegistryStore>,
    routing_log: Arc<dyn RoutingLogStore>,
    transport: Arc<dyn ButlerTransport>,
    /// Name of the butler this router runs inside; excluded from fleet-wide
    /// heartbeat rounds.
    self_name: String,
}

impl Router {
    /// Build a router for the named butler.
    pub fn new(
        self_name: impl Into<String>,
        registry: Arc<dyn RegistryStore>,
        routing_log: Arc<dyn RoutingLogStore>,
        transport: Arc<dyn ButlerTransport>,
    ) -> Self {
        Self {
            registry,
            routing_log,
            transport,
            self_name: self_name.into(),
        }
    }

    /// Route a tool call to a target butler.
    ///
    /// Verifies the target exists and is eligible, invokes the tool over the
    /// transport, and records a routing-log row either way. The log write is
    /// best-effort: a log failure is warned about, never surfaced.
    #[instrument(skip(self, args, origin), fields(target = %target, tool = %tool))]
    pub async fn route(
        &self,
        target: &str,
        tool: &str,
        args: &Value,
        origin: &RouteOrigin,
    ) -> Result<Value, RoutingError> {
        let record = self
            .registry
            .get(target)
            .await?
            .ok_or_else(|| RoutingError::ButlerNotFound(target.to_owned()))?;

        if !record.is_eligible(Utc::now()) {
            let reason = match record.eligibility_state {
                EligibilityState::Quarantined => "quarantined".to_owned(),
                EligibilityState::Draining => "draining".to_owned(),
                EligibilityState::Active => "liveness TTL expired".to_owned(),
            };
            self.log_attempt(
                RoutingLogEntry::failure(&origin.butler, target, tool, reason.clone())
                    .with_source(origin.source_channel.clone(), origin.thread_id.clone()),
            )
            .await;
            return Err(RoutingError::ButlerIneligible {
                name: target.to_owned(),
                reason,
            });
        }

        let started = Instant::now();
        let result = self
            .transport
            .call_tool(&record.endpoint_url, tool, args)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.log_attempt(
                    RoutingLogEntry::success(&origin.butler, target, tool, duration_ms)
                        .with_source(origin.source_channel.clone(), origin.thread_id.clone()),
                )
                .await;
                info!(duration_ms, "routed tool call");
                Ok(value)
            }
            Err(e) => {
                self.log_attempt(
                    RoutingLogEntry::failure(&origin.butler, target, tool, e.to_string())
                        .with_source(origin.source_channel.clone(), origin.thread_id.clone()),
                )
                .await;
                Err(RoutingError::ButlerUnreachable {
                    name: target.to_owned(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Post mail to another butler's mailbox.
    ///
    /// Verifies the target has the `mailbox` module enabled, then routes a
    /// `mailbox_post` call.
    pub async fn post_mail(
        &self,
        target: &str,
        sender: &str,
        sender_channel: &str,
        body: &str,
        subject: Option<&str>,
        priority: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<Value, RoutingError> {
        let record = self
            .registry
            .get(target)
            .await?
            .ok_or_else(|| RoutingError::ButlerNotFound(target.to_owned()))?;
        if !record.has_module("mailbox") {
            return Err(RoutingError::MailboxNotEnabled(target.to_owned()));
        }

        let args = json!({
            "sender": sender,
            "sender_channel": sender_channel,
            "body": body,
            "subject": subject,
            "priority": priority,
            "metadata": metadata,
        });
        self.route(target, "mailbox_post", &args, &RouteOrigin::butler(sender))
            .await
    }

    /// Classify a message into one or more target butlers via an injected
    /// LLM dispatch.
    ///
    /// The classifier's raw output is split on commas and newlines; any
    /// failure or empty result falls back to `["general"]`.
    pub async fn classify_targets<F, Fut>(&self, message: &str, classify: F) -> Vec<String>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<String, String>>,
    {
        match classify(message.to_owned()).await {
            Ok(raw) => {
                let targets = parse_classifier_output(&raw);
                if targets.is_empty() {
                    warn!("classifier returned no usable targets; falling back");
                    vec![FALLBACK_TARGET.to_owned()]
                } else {
                    targets
                }
            }
            Err(e) => {
                warn!(error = %e, "classification dispatch failed; falling back");
                vec![FALLBACK_TARGET.to_owned()]
            }
        }
    }

    /// Invoke `call` once per target, recording partial failures instead of
    /// propagating them.
    pub async fn dispatch_to_targets<F, Fut>(
        &self,
        targets: &[String],
        message: &str,
        call: F,
    ) -> Vec<DispatchResult>
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            match call(target.clone(), message.to_owned()).await {
                Ok(value) => results.push(DispatchResult {
                    target: target.clone(),
                    result: Some(value),
                    error: None,
                }),
                Err(e) => {
                    warn!(target = %target, error = %e, "dispatch to target failed");
                    results.push(DispatchResult {
                        target: target.clone(),
                        result: None,
                        error: Some(e),
                    });
                }
            }
        }
        results
    }

    /// Tick every registered butler except this one.
    pub async fn tick_all_butlers<F, Fut>(&self, tick: F) -> Result<TickSummary, RoutingError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let butlers = self.registry.list().await?;
        let mut summary = TickSummary {
            total: 0,
            successful: 0,
            failed: Vec::new(),
        };

        for record in butlers {
            if record.name == self.self_name {
                continue;
            }
            summary.total += 1;
            match tick(record.name.clone()).await {
                Ok(()) => summary.successful += 1,
                Err(e) => {
                    warn!(butler = %record.name, error = %e, "butler tick failed");
                    summary.failed.push(TickFailure {
                        name: record.name,
                        error: e,
                    });
                }
            }
        }

        Ok(summary)
    }

    async fn log_attempt(&self, entry: RoutingLogEntry) {
        if let Err(e) = self.routing_log.append(entry).await {
            warn!(error = %e, "failed to append routing log entry");
        }
    }
}

/// Split classifier output into butler names (comma- or newline-separated).
#[must_use]
pub fn parse_classifier_output(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(|c| c == ',' || c == '\n')
        .map(|part| part.trim().trim_matches('"').to_lowercase())
        .filter(|part| !part.is_empty())
        .filter(|part| part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .filter(|part| seen.insert(part.clone()))
        .collect()
}

/// Concatenate fan-out responses into one reply, noting failures.
#[must_use]
pub fn aggregate_responses(responses: &[DispatchResult]) -> String {
    let mut sections = Vec::with_capacity(responses.len());
    for response in responses {
        match (&response.result, &response.error) {
            (Some(value), _) => {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                sections.push(format!("[{}] {rendered}", response.target));
            }
            (None, Some(error)) => {
                sections.push(format!("[{}] unavailable: {error}", response.target));
            }
            (None, None) => {
                sections.push(format!("[{}] no response", response.target));
            }
        }
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_output_parsing() {
        assert_eq!(
            parse_classifier_output("finance, health\ngeneral"),
            vec!["finance", "health", "general"]
        );
        assert_eq!(parse_classifier_output("Finance"), vec!["finance"]);
        assert_eq!(
            parse_classifier_output("finance, finance,"),
            vec!["finance"]
        );
        assert!(parse_classifier_output("").is_empty());
        // Prose answers are rejected rather than routed to a nonsense name.
        assert!(parse_classifier_output("I think the finance butler").is_empty());
    }

    #[test]
    fn aggregation_notes_errors() {
        let responses = vec![
            DispatchResult {
                target: "finance".into(),
                result: Some(Value::String("done".into())),
                error: None,
            },
            DispatchResult {
                target: "health".into(),
                result: None,
                error: Some("timeout".into()),
            },
        ];
        let combined = aggregate_responses(&responses);
        assert!(combined.contains("[finance] done"));
        assert!(combined.contains("[health] unavailable: timeout"));
    }
}
