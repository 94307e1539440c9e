use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use butlers_contracts::SourceChannel;

use crate::telemetry::TriageTelemetry;

const FORCE_PREFIX: &str = "force:";
const DISABLED_OVERRIDE: &str = "disabled";
const DEFAULT_TTL_DAYS: u32 = 30;

/// A routing-history query failed. Affinity treats this as a miss, never as
/// a fatal error.
#[derive(Debug, Error)]
#[error("routing history lookup failed: {0}")]
pub struct HistoryError(pub String);

/// Read access to the routing log, scoped to what the affinity lookup needs.
#[async_trait]
pub trait RoutingHistory: Send + Sync {
    /// Distinct butlers this email thread routed to within the TTL window,
    /// most recent first. Implementations may cap the result at two entries;
    /// the lookup only distinguishes zero, one, and many.
    async fn recent_targets(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<Vec<String>, HistoryError>;

    /// Whether any routing history exists for this thread outside the TTL
    /// window. Only consulted after `recent_targets` came back empty.
    async fn has_stale_history(
        &self,
        thread_id: &str,
        ttl_days: u32,
    ) -> Result<bool, HistoryError>;
}

/// Classification of a thread-affinity lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityOutcome {
    /// Exactly one matching butler within the TTL window.
    Hit,
    /// Thread-specific force override is active.
    ForceOverride,
    /// No thread id present, or the channel is not email.
    MissNoThreadId,
    /// No routing history inside the TTL window.
    MissNoHistory,
    /// Multiple distinct butlers in the window.
    MissConflict,
    /// History exists but only outside the TTL window.
    MissStale,
    /// Affinity globally disabled via settings.
    MissDisabledGlobal,
    /// Affinity disabled for this thread via override.
    MissDisabledThread,
    /// Lookup failed; fell through open.
    MissError,
}

impl AffinityOutcome {
    /// True when this outcome resolves a routing target (no LLM needed).
    #[must_use]
    pub fn produces_route(self) -> bool {
        matches!(self, Self::Hit | Self::ForceOverride)
    }

    /// Low-cardinality reason tag for miss telemetry.
    #[must_use]
    pub fn miss_reason(self) -> &'static str {
        match self {
            Self::MissNoThreadId => "no_thread_id",
            Self::MissNoHistory => "no_history",
            Self::MissConflict => "conflict",
            Self::MissStale => "stale",
            Self::MissDisabledGlobal | Self::MissDisabledThread => "disabled",
            Self::MissError => "error",
            Self::Hit | Self::ForceOverride => "no_history",
        }
    }
}

/// Result of a thread-affinity lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityResult {
    pub outcome: AffinityOutcome,
    /// Resolved butler when the outcome produces a route.
    pub target_butler: Option<String>,
}

impl AffinityResult {
    fn miss(outcome: AffinityOutcome) -> Self {
        Self {
            outcome,
            target_butler: None,
        }
    }
}

/// In-memory view of the thread-affinity settings row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinitySettings {
    pub enabled: bool,
    pub ttl_days: u32,
    /// Per-thread overrides: `"disabled"` or `"force:<butler>"`.
    pub thread_overrides: HashMap<String, String>,
}

impl AffinitySettings {
    /// Safe defaults used when the settings row cannot be loaded: affinity
    /// enabled, 30-day window, no overrides.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            enabled: true,
            ttl_days: DEFAULT_TTL_DAYS,
            thread_overrides: HashMap::new(),
        }
    }
}

impl Default for AffinitySettings {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Check for a thread-specific override. `None` means no override applies.
fn check_override(thread_id: &str, settings: &AffinitySettings) -> Option<AffinityResult> {
    let value = settings.thread_overrides.get(thread_id)?;

    if value == DISABLED_OVERRIDE {
        return Some(AffinityResult::miss(AffinityOutcome::MissDisabledThread));
    }

    if let Some(target) = value.strip_prefix(FORCE_PREFIX) {
        if !target.is_empty() {
            return Some(AffinityResult {
                outcome: AffinityOutcome::ForceOverride,
                target_butler: Some(target.to_owned()),
            });
        }
        warn!(value, "malformed force override for thread; ignoring");
    } else {
        warn!(value, "unknown thread override value; ignoring");
    }
    None
}

/// Look up thread-affinity routing for an incoming email.
///
/// Order of checks: channel gate, global disable, thread override, thread id
/// presence, routing history within TTL. Every failure path fails open to a
/// miss so triage can continue to the rule evaluator and LLM fallback.
pub async fn lookup_thread_affinity(
    history: &dyn RoutingHistory,
    settings: &AffinitySettings,
    thread_id: Option<&str>,
    source_channel: SourceChannel,
    telemetry: &TriageTelemetry,
) -> AffinityResult {
    if source_channel != SourceChannel::Email {
        return AffinityResult::miss(AffinityOutcome::MissNoThreadId);
    }

    if !settings.enabled {
        telemetry.record_miss("disabled");
        return AffinityResult::miss(AffinityOutcome::MissDisabledGlobal);
    }

    let clean_thread_id = thread_id.map(str::trim).filter(|t| !t.is_empty());

    if let Some(tid) = clean_thread_id
        && let Some(result) = check_override(tid, settings)
    {
        match result.outcome {
            AffinityOutcome::ForceOverride => {
                telemetry.record_hit(result.target_butler.as_deref().unwrap_or("unknown"));
            }
            outcome => telemetry.record_miss(outcome.miss_reason()),
        }
        return result;
    }

    let Some(tid) = clean_thread_id else {
        telemetry.record_miss("no_thread_id");
        return AffinityResult::miss(AffinityOutcome::MissNoThreadId);
    };

    let targets = match history.recent_targets(tid, settings.ttl_days).await {
        Ok(targets) => targets,
        Err(e) => {
            warn!(error = %e, "thread affinity lookup failed; failing open");
            telemetry.record_miss("error");
            return AffinityResult::miss(AffinityOutcome::MissError);
        }
    };

    match targets.len() {
        0 => {
            // Distinguish "never seen" from "seen, but outside the window".
            let stale = history
                .has_stale_history(tid, settings.ttl_days)
                .await
                .unwrap_or(false);
            if stale {
                telemetry.record_stale();
                return AffinityResult::miss(AffinityOutcome::MissStale);
            }
            telemetry.record_miss("no_history");
            AffinityResult::miss(AffinityOutcome::MissNoHistory)
        }
        1 => {
            let target = targets.into_iter().next().expect("len checked");
            telemetry.record_hit(&target);
            AffinityResult {
                outcome: AffinityOutcome::Hit,
                target_butler: Some(target),
            }
        }
        _ => {
            telemetry.record_miss("conflict");
            AffinityResult::miss(AffinityOutcome::MissConflict)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted history for exercising each lookup path.
    struct FakeHistory {
        recent: Result<Vec<String>, String>,
        stale: bool,
    }

    impl FakeHistory {
        fn with_targets(targets: &[&str]) -> Self {
            Self {
                recent: Ok(targets.iter().map(|s| (*s).to_owned()).collect()),
                stale: false,
            }
        }

        fn failing() -> Self {
            Self {
                recent: Err("connection refused".into()),
                stale: false,
            }
        }
    }

    #[async_trait]
    impl RoutingHistory for FakeHistory {
        async fn recent_targets(
            &self,
            _thread_id: &str,
            _ttl_days: u32,
        ) -> Result<Vec<String>, HistoryError> {
            self.recent.clone().map_err(HistoryError)
        }

        async fn has_stale_history(
            &self,
            _thread_id: &str,
            _ttl_days: u32,
        ) -> Result<bool, HistoryError> {
            Ok(self.stale)
        }
    }

    fn telemetry() -> TriageTelemetry {
        TriageTelemetry::new()
    }

    #[tokio::test]
    async fn single_target_is_a_hit() {
        let history = FakeHistory::with_targets(&["health"]);
        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::Hit);
        assert_eq!(result.target_butler.as_deref(), Some("health"));
        assert!(result.outcome.produces_route());
    }

    #[tokio::test]
    async fn non_email_channel_never_applies() {
        let history = FakeHistory::with_targets(&["health"]);
        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            SourceChannel::Telegram,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissNoThreadId);
    }

    #[tokio::test]
    async fn global_disable_misses() {
        let history = FakeHistory::with_targets(&["health"]);
        let settings = AffinitySettings {
            enabled: false,
            ..AffinitySettings::defaults()
        };
        let result = lookup_thread_affinity(
            &history,
            &settings,
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissDisabledGlobal);
    }

    #[tokio::test]
    async fn thread_disable_override_misses() {
        let history = FakeHistory::with_targets(&["health"]);
        let mut settings = AffinitySettings::defaults();
        settings
            .thread_overrides
            .insert("t1".into(), "disabled".into());
        let result = lookup_thread_affinity(
            &history,
            &settings,
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissDisabledThread);
    }

    #[tokio::test]
    async fn force_override_routes_without_history() {
        let history = FakeHistory::failing();
        let mut settings = AffinitySettings::defaults();
        settings
            .thread_overrides
            .insert("t1".into(), "force:finance".into());
        let result = lookup_thread_affinity(
            &history,
            &settings,
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::ForceOverride);
        assert_eq!(result.target_butler.as_deref(), Some("finance"));
    }

    #[tokio::test]
    async fn malformed_force_override_is_ignored() {
        let history = FakeHistory::with_targets(&["health"]);
        let mut settings = AffinitySettings::defaults();
        settings.thread_overrides.insert("t1".into(), "force:".into());
        let result = lookup_thread_affinity(
            &history,
            &settings,
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::Hit);
    }

    #[tokio::test]
    async fn missing_thread_id_misses() {
        let history = FakeHistory::with_targets(&["health"]);
        for tid in [None, Some(""), Some("   ")] {
            let result = lookup_thread_affinity(
                &history,
                &AffinitySettings::defaults(),
                tid,
                SourceChannel::Email,
                &telemetry(),
            )
            .await;
            assert_eq!(result.outcome, AffinityOutcome::MissNoThreadId);
        }
    }

    #[tokio::test]
    async fn conflict_when_multiple_butlers() {
        let history = FakeHistory::with_targets(&["health", "finance"]);
        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissConflict);
        assert!(result.target_butler.is_none());
    }

    #[tokio::test]
    async fn stale_history_is_distinguished_from_none() {
        let mut history = FakeHistory::with_targets(&[]);
        history.stale = true;
        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissStale);

        let history = FakeHistory::with_targets(&[]);
        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            SourceChannel::Email,
            &telemetry(),
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissNoHistory);
    }

    #[tokio::test]
    async fn lookup_errors_fail_open() {
        let history = FakeHistory::failing();
        let t = telemetry();
        let result = lookup_thread_affinity(
            &history,
            &AffinitySettings::defaults(),
            Some("t1"),
            SourceChannel::Email,
            &t,
        )
        .await;
        assert_eq!(result.outcome, AffinityOutcome::MissError);
        assert_eq!(t.misses("error"), 1);
    }
}
