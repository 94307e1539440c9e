use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// The four deterministic rule families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    SenderDomain,
    SenderAddress,
    HeaderCondition,
    MimeType,
}

impl RuleType {
    /// Stable string used in storage and telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SenderDomain => "sender_domain",
            Self::SenderAddress => "sender_address",
            Self::HeaderCondition => "header_condition",
            Self::MimeType => "mime_type",
        }
    }
}

impl FromStr for RuleType {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sender_domain" => Ok(Self::SenderDomain),
            "sender_address" => Ok(Self::SenderAddress),
            "header_condition" => Ok(Self::HeaderCondition),
            "mime_type" => Ok(Self::MimeType),
            other => Err(RuleParseError::UnknownRuleType(other.to_owned())),
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a `sender_domain` condition compares domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainMatch {
    #[default]
    Exact,
    /// Matches the domain itself or any subdomain (`chase.com` matches
    /// `alerts.chase.com`).
    Suffix,
}

/// Comparison operator for a `header_condition` rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOp {
    Present,
    Equals,
    Contains,
}

/// A parsed, typed rule condition.
///
/// Conditions are stored as JSONB; [`RuleCondition::from_value`] parses them
/// once at cache-load time so evaluation stays allocation-free.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleCondition {
    SenderDomain {
        domain: String,
        match_mode: DomainMatch,
    },
    SenderAddress {
        address: String,
    },
    Header {
        header: String,
        op: HeaderOp,
        value: Option<String>,
    },
    MimeType {
        pattern: String,
    },
}

impl RuleCondition {
    /// Parse a JSONB condition for the given rule type.
    pub fn from_value(rule_type: RuleType, condition: &Value) -> Result<Self, RuleParseError> {
        let get_str = |key: &str| -> Option<String> {
            condition
                .get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
        };

        match rule_type {
            RuleType::SenderDomain => {
                let domain = get_str("domain")
                    .ok_or_else(|| RuleParseError::MissingField("domain"))?
                    .to_lowercase();
                let match_mode = match condition.get("match").and_then(Value::as_str) {
                    None | Some("exact") => DomainMatch::Exact,
                    Some("suffix") => DomainMatch::Suffix,
                    Some(other) => {
                        return Err(RuleParseError::InvalidField {
                            field: "match",
                            detail: other.to_owned(),
                        });
                    }
                };
                Ok(Self::SenderDomain { domain, match_mode })
            }
            RuleType::SenderAddress => {
                let address = get_str("address")
                    .ok_or_else(|| RuleParseError::MissingField("address"))?
                    .to_lowercase();
                Ok(Self::SenderAddress { address })
            }
            RuleType::HeaderCondition => {
                let header =
                    get_str("header").ok_or_else(|| RuleParseError::MissingField("header"))?;
                let op = match condition.get("op").and_then(Value::as_str) {
                    Some("present") => HeaderOp::Present,
                    Some("equals") => HeaderOp::Equals,
                    Some("contains") => HeaderOp::Contains,
                    Some(other) => {
                        return Err(RuleParseError::InvalidField {
                            field: "op",
                            detail: other.to_owned(),
                        });
                    }
                    None => return Err(RuleParseError::MissingField("op")),
                };
                let value = condition
                    .get("value")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                Ok(Self::Header { header, op, value })
            }
            RuleType::MimeType => {
                let pattern = get_str("type")
                    .ok_or_else(|| RuleParseError::MissingField("type"))?
                    .to_lowercase();
                Ok(Self::MimeType { pattern })
            }
        }
    }

    /// The rule type this condition belongs to.
    #[must_use]
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::SenderDomain { .. } => RuleType::SenderDomain,
            Self::SenderAddress { .. } => RuleType::SenderAddress,
            Self::Header { .. } => RuleType::HeaderCondition,
            Self::MimeType { .. } => RuleType::MimeType,
        }
    }
}

/// What a matched rule does with the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Skip,
    MetadataOnly,
    LowPriorityQueue,
    PassThrough,
    RouteTo(String),
}

impl RuleAction {
    /// Storage string for this action (`route_to:<butler>` for routing).
    #[must_use]
    pub fn storage_string(&self) -> String {
        match self {
            Self::Skip => "skip".into(),
            Self::MetadataOnly => "metadata_only".into(),
            Self::LowPriorityQueue => "low_priority_queue".into(),
            Self::PassThrough => "pass_through".into(),
            Self::RouteTo(butler) => format!("route_to:{butler}"),
        }
    }
}

impl FromStr for RuleAction {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(target) = s.strip_prefix("route_to:") {
            let target = target.trim();
            if target.is_empty() {
                return Err(RuleParseError::InvalidField {
                    field: "action",
                    detail: s.to_owned(),
                });
            }
            return Ok(Self::RouteTo(target.to_owned()));
        }
        match s {
            "skip" => Ok(Self::Skip),
            "metadata_only" => Ok(Self::MetadataOnly),
            "low_priority_queue" => Ok(Self::LowPriorityQueue),
            "pass_through" => Ok(Self::PassThrough),
            other => Err(RuleParseError::InvalidField {
                field: "action",
                detail: other.to_owned(),
            }),
        }
    }
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.storage_string())
    }
}

/// A rule could not be parsed from its stored representation.
///
/// Malformed rules are skipped at cache-load time with a warning; a bad rule
/// must never take triage down.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),
    #[error("condition is missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid value for '{field}': {detail}")]
    InvalidField { field: &'static str, detail: String },
}

/// One deterministic triage rule, parsed and ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageRule {
    pub id: Uuid,
    pub condition: RuleCondition,
    pub action: RuleAction,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl TriageRule {
    /// Build a rule from stored parts, parsing the JSONB condition and the
    /// action string.
    pub fn from_stored(
        id: Uuid,
        rule_type: &str,
        condition: &Value,
        action: &str,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Result<Self, RuleParseError> {
        let rule_type: RuleType = rule_type.parse()?;
        Ok(Self {
            id,
            condition: RuleCondition::from_value(rule_type, condition)?,
            action: action.parse()?,
            priority,
            created_at,
        })
    }
}

/// Sort rules into evaluation order: `(priority ASC, created_at ASC, id ASC)`.
pub fn sort_rules(rules: &mut [TriageRule]) {
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sender_domain_condition() {
        let cond = RuleCondition::from_value(
            RuleType::SenderDomain,
            &json!({"domain": "Chase.COM", "match": "suffix"}),
        )
        .unwrap();
        assert_eq!(
            cond,
            RuleCondition::SenderDomain {
                domain: "chase.com".into(),
                match_mode: DomainMatch::Suffix,
            }
        );
    }

    #[test]
    fn sender_domain_defaults_to_exact() {
        let cond =
            RuleCondition::from_value(RuleType::SenderDomain, &json!({"domain": "x.org"})).unwrap();
        assert!(matches!(
            cond,
            RuleCondition::SenderDomain {
                match_mode: DomainMatch::Exact,
                ..
            }
        ));
    }

    #[test]
    fn rejects_empty_domain() {
        let err = RuleCondition::from_value(RuleType::SenderDomain, &json!({"domain": "  "}))
            .unwrap_err();
        assert_eq!(err, RuleParseError::MissingField("domain"));
    }

    #[test]
    fn action_round_trips() {
        for raw in ["skip", "metadata_only", "low_priority_queue", "pass_through"] {
            let action: RuleAction = raw.parse().unwrap();
            assert_eq!(action.storage_string(), raw);
        }
        let action: RuleAction = "route_to:finance".parse().unwrap();
        assert_eq!(action, RuleAction::RouteTo("finance".into()));
        assert_eq!(action.storage_string(), "route_to:finance");
    }

    #[test]
    fn rejects_empty_route_target() {
        assert!("route_to:".parse::<RuleAction>().is_err());
    }

    #[test]
    fn sort_order_is_priority_then_created_then_id() {
        let base = Utc::now();
        let make = |priority: i32, offset_s: i64, id: u128| TriageRule {
            id: Uuid::from_u128(id),
            condition: RuleCondition::SenderAddress {
                address: "a@b.c".into(),
            },
            action: RuleAction::Skip,
            priority,
            created_at: base + chrono::Duration::seconds(offset_s),
        };
        let mut rules = vec![make(20, 0, 1), make(10, 5, 3), make(10, 5, 2), make(10, 0, 9)];
        sort_rules(&mut rules);
        let ids: Vec<u128> = rules.iter().map(|r| r.id.as_u128()).collect();
        assert_eq!(ids, vec![9, 2, 3, 1]);
    }
}
