use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use butlers_contracts::{IngestEnvelope, SourceChannel};

use crate::rule::{DomainMatch, HeaderOp, RuleAction, RuleCondition, TriageRule};

/// Normalized projection of an ingest envelope -- just the fields the
/// evaluator consumes.
#[derive(Debug, Clone, Default)]
pub struct TriageSummary {
    /// Full sender address, lowercased.
    pub sender_address: String,
    /// Source channel string (`email`, `telegram`, ...).
    pub source_channel: String,
    /// Headers as received; key comparison is case-insensitive at eval time.
    pub headers: HashMap<String, String>,
    /// MIME type strings from attachments and message parts, lowercased.
    pub mime_parts: Vec<String>,
    /// External thread identity, consumed by the affinity lookup.
    pub thread_id: Option<String>,
}

impl TriageSummary {
    /// Project a validated ingest envelope into the evaluator's view.
    ///
    /// Headers come from `payload.raw.headers`; MIME parts from
    /// `payload.raw.attachments[].media_type` and `payload.raw.mime_parts`.
    /// Missing or oddly-shaped fields degrade to empty, never to an error.
    #[must_use]
    pub fn from_ingest(envelope: &IngestEnvelope) -> Self {
        let raw = &envelope.payload.raw;

        let headers = raw
            .get("headers")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| {
                        let rendered = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), rendered)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut mime_parts: Vec<String> = Vec::new();
        if let Some(attachments) = raw.get("attachments").and_then(Value::as_array) {
            for att in attachments {
                if let Some(media_type) = att.get("media_type").and_then(Value::as_str) {
                    mime_parts.push(media_type.to_lowercase());
                }
            }
        }
        if let Some(parts) = raw.get("mime_parts").and_then(Value::as_array) {
            for part in parts {
                match part {
                    Value::String(s) => mime_parts.push(s.to_lowercase()),
                    Value::Object(obj) => {
                        if let Some(t) = obj.get("type").and_then(Value::as_str) {
                            mime_parts.push(t.to_lowercase());
                        }
                    }
                    _ => {}
                }
            }
        }

        Self {
            sender_address: envelope.sender.identity.as_str().to_lowercase(),
            source_channel: envelope.source.channel.as_str().to_owned(),
            headers,
            mime_parts,
            thread_id: envelope
                .event
                .external_thread_id
                .as_ref()
                .map(|t| t.as_str().to_owned()),
        }
    }

    /// Whether the affinity lookup applies to this envelope.
    #[must_use]
    pub fn is_email(&self) -> bool {
        self.source_channel == SourceChannel::Email.as_str()
    }
}

/// Final routing disposition of the triage pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    RouteTo,
    Skip,
    MetadataOnly,
    LowPriorityQueue,
    PassThrough,
}

impl Disposition {
    /// Stable string used in logs and telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RouteTo => "route_to",
            Self::Skip => "skip",
            Self::MetadataOnly => "metadata_only",
            Self::LowPriorityQueue => "low_priority_queue",
            Self::PassThrough => "pass_through",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the deterministic triage evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageDecision {
    pub disposition: Disposition,
    /// Set when `disposition` is `RouteTo`.
    pub target_butler: Option<String>,
    /// Id of the matched rule; `None` for thread affinity and no-match.
    pub matched_rule_id: Option<Uuid>,
    /// `sender_domain`, `sender_address`, `header_condition`, `mime_type`,
    /// `thread_affinity`, or `None` when nothing matched.
    pub matched_rule_type: Option<&'static str>,
    pub reason: String,
}

impl TriageDecision {
    /// True when this decision means no LLM classification is needed.
    #[must_use]
    pub fn bypasses_llm(&self) -> bool {
        self.disposition != Disposition::PassThrough
    }

    fn pass_through() -> Self {
        Self {
            disposition: Disposition::PassThrough,
            target_butler: None,
            matched_rule_id: None,
            matched_rule_type: None,
            reason: "no deterministic rule matched".into(),
        }
    }
}

/// Evaluate the triage pipeline and return a decision.
///
/// `thread_affinity_target` is the pre-resolved affinity hit, if any; it
/// takes precedence over every rule. Rules must already be in evaluation
/// order (see [`sort_rules`](crate::rule::sort_rules)); the first matching
/// rule wins, and no match yields `pass_through`.
#[must_use]
pub fn evaluate(
    summary: &TriageSummary,
    rules: &[TriageRule],
    thread_affinity_target: Option<&str>,
) -> TriageDecision {
    if let Some(target) = thread_affinity_target {
        return TriageDecision {
            disposition: Disposition::RouteTo,
            target_butler: Some(target.to_owned()),
            matched_rule_id: None,
            matched_rule_type: Some("thread_affinity"),
            reason: format!("thread affinity match -> {target}"),
        };
    }

    for rule in rules {
        if !matches_condition(summary, &rule.condition) {
            continue;
        }

        let rule_type = rule.condition.rule_type().as_str();
        let action_str = rule.action.storage_string();
        let (disposition, target_butler) = match &rule.action {
            RuleAction::Skip => (Disposition::Skip, None),
            RuleAction::MetadataOnly => (Disposition::MetadataOnly, None),
            RuleAction::LowPriorityQueue => (Disposition::LowPriorityQueue, None),
            RuleAction::PassThrough => (Disposition::PassThrough, None),
            RuleAction::RouteTo(butler) => (Disposition::RouteTo, Some(butler.clone())),
        };

        return TriageDecision {
            disposition,
            target_butler,
            matched_rule_id: Some(rule.id),
            matched_rule_type: Some(rule_type),
            reason: format!("{rule_type} match -> {action_str}"),
        };
    }

    TriageDecision::pass_through()
}

/// Extract the lowercase domain from a sender address.
fn sender_domain(address: &str) -> &str {
    let trimmed = address.trim();
    match trimmed.split_once('@') {
        Some((_, domain)) => domain,
        None => trimmed,
    }
}

fn matches_condition(summary: &TriageSummary, condition: &RuleCondition) -> bool {
    match condition {
        RuleCondition::SenderDomain { domain, match_mode } => {
            let sender = sender_domain(&summary.sender_address);
            match match_mode {
                DomainMatch::Exact => sender == domain,
                DomainMatch::Suffix => {
                    sender == domain || sender.ends_with(&format!(".{domain}"))
                }
            }
        }
        RuleCondition::SenderAddress { address } => {
            summary.sender_address.trim() == address.as_str()
        }
        RuleCondition::Header { header, op, value } => {
            let matched_value = summary
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(header))
                .map(|(_, v)| v.as_str());
            match op {
                HeaderOp::Present => matched_value.is_some(),
                HeaderOp::Equals => match (matched_value, value) {
                    (Some(actual), Some(expected)) => actual.trim() == expected.trim(),
                    _ => false,
                },
                HeaderOp::Contains => match (matched_value, value) {
                    (Some(actual), Some(expected)) => actual.contains(expected.as_str()),
                    _ => false,
                },
            }
        }
        RuleCondition::MimeType { pattern } => {
            if let Some(main_type) = pattern.strip_suffix("/*") {
                summary.mime_parts.iter().any(|part| {
                    let part = part.trim();
                    part.starts_with(&format!("{main_type}/")) || part == main_type
                })
            } else {
                summary
                    .mime_parts
                    .iter()
                    .any(|part| part.trim() == pattern)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::rule::RuleType;

    fn summary(sender: &str) -> TriageSummary {
        TriageSummary {
            sender_address: sender.to_lowercase(),
            source_channel: "email".into(),
            ..Default::default()
        }
    }

    fn rule(id: u128, rule_type: RuleType, condition: Value, action: &str) -> TriageRule {
        TriageRule::from_stored(
            Uuid::from_u128(id),
            rule_type.as_str(),
            &condition,
            action,
            10,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn domain_suffix_rule_routes_to_finance() {
        let rules = vec![rule(
            1,
            RuleType::SenderDomain,
            json!({"domain": "chase.com", "match": "suffix"}),
            "route_to:finance",
        )];
        let decision = evaluate(&summary("alerts@chase.com"), &rules, None);
        assert_eq!(decision.disposition, Disposition::RouteTo);
        assert_eq!(decision.target_butler.as_deref(), Some("finance"));
        assert_eq!(decision.matched_rule_id, Some(Uuid::from_u128(1)));
        assert_eq!(decision.matched_rule_type, Some("sender_domain"));
        assert!(decision.reason.contains("route_to:finance"));
        assert!(decision.bypasses_llm());
    }

    #[test]
    fn suffix_matches_subdomain_but_not_lookalike() {
        let rules = vec![rule(
            1,
            RuleType::SenderDomain,
            json!({"domain": "chase.com", "match": "suffix"}),
            "route_to:finance",
        )];
        let hit = evaluate(&summary("noreply@alerts.chase.com"), &rules, None);
        assert_eq!(hit.disposition, Disposition::RouteTo);

        let miss = evaluate(&summary("noreply@notchase.com"), &rules, None);
        assert_eq!(miss.disposition, Disposition::PassThrough);
    }

    #[test]
    fn exact_domain_does_not_match_subdomain() {
        let rules = vec![rule(
            1,
            RuleType::SenderDomain,
            json!({"domain": "chase.com", "match": "exact"}),
            "skip",
        )];
        let decision = evaluate(&summary("x@alerts.chase.com"), &rules, None);
        assert_eq!(decision.disposition, Disposition::PassThrough);
    }

    #[test]
    fn sender_address_is_case_insensitive() {
        let rules = vec![rule(
            1,
            RuleType::SenderAddress,
            json!({"address": "Alerts@Chase.com"}),
            "skip",
        )];
        let decision = evaluate(&summary("ALERTS@CHASE.COM"), &rules, None);
        assert_eq!(decision.disposition, Disposition::Skip);
    }

    #[test]
    fn header_present_is_key_case_insensitive() {
        let mut s = summary("a@b.c");
        s.headers
            .insert("List-Unsubscribe".into(), "<mailto:u@x>".into());
        let rules = vec![rule(
            1,
            RuleType::HeaderCondition,
            json!({"header": "list-unsubscribe", "op": "present"}),
            "low_priority_queue",
        )];
        let decision = evaluate(&s, &rules, None);
        assert_eq!(decision.disposition, Disposition::LowPriorityQueue);
    }

    #[test]
    fn header_equals_trims_both_sides() {
        let mut s = summary("a@b.c");
        s.headers.insert("X-Priority".into(), "  1  ".into());
        let rules = vec![rule(
            1,
            RuleType::HeaderCondition,
            json!({"header": "X-Priority", "op": "equals", "value": "1"}),
            "skip",
        )];
        assert_eq!(evaluate(&s, &rules, None).disposition, Disposition::Skip);
    }

    #[test]
    fn header_contains_is_raw_substring() {
        let mut s = summary("a@b.c");
        s.headers
            .insert("Subject".into(), "Re: invoice overdue".into());
        let rules = vec![rule(
            1,
            RuleType::HeaderCondition,
            json!({"header": "subject", "op": "contains", "value": "invoice"}),
            "route_to:finance",
        )];
        assert_eq!(evaluate(&s, &rules, None).disposition, Disposition::RouteTo);
    }

    #[test]
    fn mime_wildcard_matches_subtypes() {
        let mut s = summary("a@b.c");
        s.mime_parts = vec!["image/png".into()];
        let rules = vec![rule(
            1,
            RuleType::MimeType,
            json!({"type": "image/*"}),
            "metadata_only",
        )];
        assert_eq!(
            evaluate(&s, &rules, None).disposition,
            Disposition::MetadataOnly
        );
    }

    #[test]
    fn mime_exact_match() {
        let mut s = summary("a@b.c");
        s.mime_parts = vec!["text/calendar".into()];
        let rules = vec![rule(
            1,
            RuleType::MimeType,
            json!({"type": "text/calendar"}),
            "route_to:general",
        )];
        assert_eq!(evaluate(&s, &rules, None).disposition, Disposition::RouteTo);
    }

    #[test]
    fn first_match_wins_in_order() {
        let rules = vec![
            rule(
                1,
                RuleType::SenderDomain,
                json!({"domain": "chase.com", "match": "suffix"}),
                "skip",
            ),
            rule(
                2,
                RuleType::SenderDomain,
                json!({"domain": "chase.com", "match": "suffix"}),
                "route_to:finance",
            ),
        ];
        let decision = evaluate(&summary("a@chase.com"), &rules, None);
        assert_eq!(decision.disposition, Disposition::Skip);
        assert_eq!(decision.matched_rule_id, Some(Uuid::from_u128(1)));
    }

    #[test]
    fn thread_affinity_bypasses_rules() {
        let rules = vec![rule(
            1,
            RuleType::SenderDomain,
            json!({"domain": "chase.com", "match": "suffix"}),
            "route_to:finance",
        )];
        let decision = evaluate(&summary("a@chase.com"), &rules, Some("health"));
        assert_eq!(decision.disposition, Disposition::RouteTo);
        assert_eq!(decision.target_butler.as_deref(), Some("health"));
        assert_eq!(decision.matched_rule_type, Some("thread_affinity"));
        assert!(decision.matched_rule_id.is_none());
    }

    #[test]
    fn no_match_passes_through() {
        let decision = evaluate(&summary("someone@example.org"), &[], None);
        assert_eq!(decision.disposition, Disposition::PassThrough);
        assert!(!decision.bypasses_llm());
        assert!(decision.matched_rule_id.is_none());
        assert!(decision.matched_rule_type.is_none());
    }

    #[test]
    fn decision_shape_is_exclusive() {
        // Exactly one of: matched rule id, thread_affinity, or pass_through.
        let rules = vec![rule(
            1,
            RuleType::SenderAddress,
            json!({"address": "a@b.c"}),
            "skip",
        )];
        for (summary_addr, affinity) in [("a@b.c", None), ("z@z.z", Some("health")), ("z@z.z", None)]
        {
            let d = evaluate(&summary(summary_addr), &rules, affinity);
            let rule_match = d.matched_rule_id.is_some();
            let affinity_match = d.matched_rule_type == Some("thread_affinity");
            let pass = d.disposition == Disposition::PassThrough;
            assert_eq!(
                u8::from(rule_match) + u8::from(affinity_match) + u8::from(pass),
                1
            );
        }
    }

    #[test]
    fn summary_projection_extracts_headers_and_mime() {
        let payload = json!({
            "schema_version": "ingest.v1",
            "source": {"channel": "email", "provider": "imap", "endpoint_identity": "in@x.com"},
            "event": {"external_event_id": "e1", "external_thread_id": "t1", "observed_at": "2026-02-18T10:00:00Z"},
            "sender": {"identity": "Alerts@Chase.com"},
            "payload": {
                "raw": {
                    "headers": {"List-Unsubscribe": "<mailto:u@x>", "X-Count": 3},
                    "attachments": [{"media_type": "IMAGE/PNG"}],
                    "mime_parts": ["text/plain", {"type": "Text/HTML"}]
                },
                "normalized_text": "hello"
            }
        });
        let envelope = butlers_contracts::parse_ingest(&payload).unwrap();
        let s = TriageSummary::from_ingest(&envelope);
        assert_eq!(s.sender_address, "alerts@chase.com");
        assert!(s.is_email());
        assert_eq!(s.thread_id.as_deref(), Some("t1"));
        assert_eq!(s.headers.get("X-Count").map(String::as_str), Some("3"));
        assert_eq!(
            s.mime_parts,
            vec!["image/png", "text/plain", "text/html"]
        );
    }
}
