use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Routing eligibility of a registered butler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityState {
    /// Routable while fresh within the liveness TTL.
    Active,
    /// Operator-quarantined: no routing until cleared.
    Quarantined,
    /// In-flight work may finish; no new routes.
    Draining,
}

impl EligibilityState {
    /// Stable storage string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Quarantined => "quarantined",
            Self::Draining => "draining",
        }
    }
}

impl FromStr for EligibilityState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "quarantined" => Ok(Self::Quarantined),
            "draining" => Ok(Self::Draining),
            other => Err(format!("unknown eligibility state: {other}")),
        }
    }
}

impl std::fmt::Display for EligibilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields supplied when a butler registers (or re-registers) itself.
#[derive(Debug, Clone)]
pub struct ButlerRegistration {
    pub name: String,
    pub endpoint_url: String,
    pub description: String,
    pub modules: Vec<String>,
    pub capabilities: Value,
    pub route_contract_min: String,
    pub route_contract_max: String,
    pub liveness_ttl_seconds: u64,
}

impl ButlerRegistration {
    /// A registration with sane defaults for the current route contract and
    /// a two-minute liveness TTL.
    #[must_use]
    pub fn new(name: impl Into<String>, endpoint_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint_url: endpoint_url.into(),
            description: String::new(),
            modules: Vec::new(),
            capabilities: Value::Object(serde_json::Map::new()),
            route_contract_min: "route.v1".into(),
            route_contract_max: "route.v1".into(),
            liveness_ttl_seconds: 120,
        }
    }

    /// Set the human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the enabled module list.
    #[must_use]
    pub fn with_modules(mut self, modules: Vec<String>) -> Self {
        self.modules = modules;
        self
    }

    /// Set the liveness TTL in seconds.
    #[must_use]
    pub fn with_liveness_ttl(mut self, seconds: u64) -> Self {
        self.liveness_ttl_seconds = seconds;
        self
    }
}

/// One row of the butler registry.
#[derive(Debug, Clone)]
pub struct ButlerRecord {
    pub name: String,
    pub endpoint_url: String,
    pub description: String,
    pub modules: Vec<String>,
    pub capabilities: Value,
    pub route_contract_min: String,
    pub route_contract_max: String,
    pub eligibility_state: EligibilityState,
    pub liveness_ttl_seconds: u64,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub quarantined_at: Option<DateTime<Utc>>,
    pub quarantine_reason: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl ButlerRecord {
    /// Whether this butler may accept new routes at `now`: it must be
    /// `active` and have been seen within its liveness TTL.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.eligibility_state != EligibilityState::Active {
            return false;
        }
        match self.last_seen_at {
            Some(seen) => {
                let age = now.signed_duration_since(seen);
                age.num_seconds() >= 0 && (age.num_seconds() as u64) <= self.liveness_ttl_seconds
            }
            None => false,
        }
    }

    /// Whether the named module is enabled for this butler.
    #[must_use]
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.iter().any(|m| m == module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(state: EligibilityState, seen_ago: Option<i64>) -> ButlerRecord {
        let now = Utc::now();
        ButlerRecord {
            name: "health".into(),
            endpoint_url: "http://localhost:4010/sse".into(),
            description: String::new(),
            modules: vec!["mailbox".into()],
            capabilities: Value::Null,
            route_contract_min: "route.v1".into(),
            route_contract_max: "route.v1".into(),
            eligibility_state: state,
            liveness_ttl_seconds: 120,
            last_seen_at: seen_ago.map(|s| now - Duration::seconds(s)),
            quarantined_at: None,
            quarantine_reason: None,
            registered_at: now,
        }
    }

    #[test]
    fn active_and_fresh_is_eligible() {
        assert!(record(EligibilityState::Active, Some(30)).is_eligible(Utc::now()));
    }

    #[test]
    fn stale_heartbeat_is_ineligible() {
        assert!(!record(EligibilityState::Active, Some(121)).is_eligible(Utc::now()));
        assert!(!record(EligibilityState::Active, None).is_eligible(Utc::now()));
    }

    #[test]
    fn quarantined_and_draining_are_ineligible() {
        assert!(!record(EligibilityState::Quarantined, Some(1)).is_eligible(Utc::now()));
        assert!(!record(EligibilityState::Draining, Some(1)).is_eligible(Utc::now()));
    }

    #[test]
    fn module_lookup() {
        let r = record(EligibilityState::Active, Some(1));
        assert!(r.has_module("mailbox"));
        assert!(!r.has_module("finance"));
    }
}
