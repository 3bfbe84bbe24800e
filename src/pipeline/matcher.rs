//! Source rule matcher — deterministic scoring of messages against the
//! configured rule set.
//!
//! For each enabled rule the score is a weighted sum of independent signal
//! hits, multiplied by the rule's confidence weight and clamped to [0, 1]:
//!
//!   sender email exact match   +0.30
//!   sender domain match        +0.20
//!   subject regex hit          +0.20
//!   body keyword coverage      +0.15 (proportional)
//!   attachment type match      +0.10
//!   attachment filename match  +0.05
//!
//! The best rule wins if its score meets that rule's own threshold; ties
//! are broken by declared priority. No rule above threshold falls to the
//! configured unknown-source policy.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{CompiledRule, RuleSet, SourceRule, UnknownSourcePolicy};
use crate::kpi::KpiValues;
use crate::sender::SenderIdentity;

use super::types::Message;

const BODY_SCAN_LIMIT: usize = 3000;

const W_SENDER: f64 = 0.30;
const W_DOMAIN: f64 = 0.20;
const W_SUBJECT: f64 = 0.20;
const W_BODY: f64 = 0.15;
const W_ATT_TYPE: f64 = 0.10;
const W_ATT_NAME: f64 = 0.05;

/// Outcome of matching one message against all rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchDecision {
    Matched,
    Quarantine,
    Skip,
}

impl From<UnknownSourcePolicy> for MatchDecision {
    fn from(policy: UnknownSourcePolicy) -> Self {
        match policy {
            UnknownSourcePolicy::Quarantine => MatchDecision::Quarantine,
            UnknownSourcePolicy::Skip => MatchDecision::Skip,
        }
    }
}

/// Result of scoring a message against the rule set.
#[derive(Debug, Clone)]
pub struct SourceMatch {
    pub matched: bool,
    pub rule_id: String,
    pub match_score: f64,
    pub report_type: String,
    pub entity: String,
    pub decision: MatchDecision,
    /// Winning rule, kept for expected-KPI validation downstream.
    pub rule: Option<SourceRule>,
    /// Full ranked score list for audit and rule tuning.
    pub all_scores: Vec<(String, f64)>,
}

impl SourceMatch {
    fn unmatched(decision: MatchDecision, all_scores: Vec<(String, f64)>) -> Self {
        Self {
            matched: false,
            rule_id: String::new(),
            match_score: 0.0,
            report_type: String::new(),
            entity: String::new(),
            decision,
            rule: None,
            all_scores,
        }
    }

    pub fn parsing_strategy(&self) -> &str {
        self.rule
            .as_ref()
            .map(|r| r.parsing.strategy.as_str())
            .unwrap_or("attachment_primary")
    }

    /// Top scores for quarantine reporting.
    pub fn top_scores(&self, n: usize) -> Vec<(String, f64)> {
        self.all_scores.iter().take(n).cloned().collect()
    }
}

/// Score `msg` against every enabled rule and pick the winner.
pub fn match_message(rules: &RuleSet, msg: &Message, sender: &SenderIdentity) -> SourceMatch {
    let fallback: MatchDecision = rules.defaults.unknown_source_policy.into();
    if rules.is_empty() {
        return SourceMatch::unmatched(fallback, vec![]);
    }

    let subject = msg.subject.to_lowercase();
    let body: String = msg.body.to_lowercase().chars().take(BODY_SCAN_LIMIT).collect();
    let att_names = msg.attachment_names().to_lowercase();

    let mut scored: Vec<(&CompiledRule, f64)> = rules
        .rules
        .iter()
        .map(|r| (r, score_rule(r, sender, &subject, &body, &att_names, msg)))
        .collect();
    // Score descending, then priority descending.
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.0.rule.priority.cmp(&a.0.rule.priority))
    });

    let all_scores: Vec<(String, f64)> = scored
        .iter()
        .map(|(r, s)| (r.rule.id.clone(), (s * 1000.0).round() / 1000.0))
        .collect();

    if let Some((best, best_score)) = scored.first() {
        if *best_score >= best.rule.threshold(&rules.defaults) {
            info!(
                rule = %best.rule.id,
                score = format!("{best_score:.3}"),
                entity = %best.rule.entity,
                report_type = %best.rule.report_type,
                "source matched"
            );
            return SourceMatch {
                matched: true,
                rule_id: best.rule.id.clone(),
                match_score: *best_score,
                report_type: best.rule.report_type.clone(),
                entity: best.rule.entity.clone(),
                decision: MatchDecision::Matched,
                rule: Some(best.rule.clone()),
                all_scores,
            };
        }
    }

    debug!(
        sender = %sender.email,
        domain = %sender.domain,
        policy = ?fallback,
        top = ?all_scores.iter().take(3).collect::<Vec<_>>(),
        "no source rule matched"
    );
    SourceMatch::unmatched(fallback, all_scores)
}

fn score_rule(
    compiled: &CompiledRule,
    sender: &SenderIdentity,
    subject: &str,
    body: &str,
    att_names: &str,
    msg: &Message,
) -> f64 {
    let rule = &compiled.rule;
    let m = &rule.match_block;
    let mut score = 0.0;

    if !sender.email.is_empty() && m.from_addresses.iter().any(|a| a == &sender.email) {
        score += W_SENDER;
    }
    if !sender.domain.is_empty() && m.from_domains.iter().any(|d| d == &sender.domain) {
        score += W_DOMAIN;
    }
    if let Some(re) = &compiled.subject_re {
        if re.is_match(subject) {
            score += W_SUBJECT;
        }
    }
    if !m.body_contains.is_empty() && !body.is_empty() {
        let hits = m.body_contains.iter().filter(|kw| body.contains(kw.as_str())).count();
        if hits > 0 {
            let proportion = (hits as f64 / m.body_contains.len() as f64).min(1.0);
            score += W_BODY * proportion;
        }
    }
    if let Some(att_rule) = rule.attachments.first() {
        if !att_rule.allowed_mime_types.is_empty()
            && msg
                .attachments
                .iter()
                .any(|a| ext_to_mime(&a.ext).is_some_and(|m2| att_rule.allowed_mime_types.iter().any(|am| am == m2)))
        {
            score += W_ATT_TYPE;
        }
    }
    if let Some(re) = &compiled.filename_re {
        if !att_names.is_empty() && re.is_match(att_names) {
            score += W_ATT_NAME;
        }
    }

    (score * rule.confidence.confidence_weight).min(1.0)
}

/// Rough extension to MIME mapping for attachment-type matching.
fn ext_to_mime(ext: &str) -> Option<&'static str> {
    match ext {
        ".xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        ".xls" => Some("application/vnd.ms-excel"),
        ".csv" => Some("text/csv"),
        ".pdf" => Some("application/pdf"),
        ".docx" => Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        _ => None,
    }
}

// ── Expected-KPI validation ─────────────────────────────────────────

/// Validation of extracted values against the matched rule's expectations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiValidation {
    pub valid: bool,
    pub missing_required: Vec<String>,
    pub present_kpis: Vec<String>,
    /// Proportion of expected KPIs actually found, in [0, 1].
    pub parse_confidence: f64,
}

/// Check extracted values against the winning rule's `expected_kpis`.
///
/// An unmatched message has no per-source expectations and always validates.
pub fn validate_extracted_kpis(values: &KpiValues, source_match: &SourceMatch) -> KpiValidation {
    let Some(rule) = source_match.rule.as_ref().filter(|_| source_match.matched) else {
        return KpiValidation {
            valid: true,
            missing_required: vec![],
            present_kpis: vec![],
            parse_confidence: 0.0,
        };
    };

    if rule.expected_kpis.is_empty() {
        return KpiValidation {
            valid: true,
            missing_required: vec![],
            present_kpis: vec![],
            parse_confidence: 0.5,
        };
    }

    let has_value = |key: &str| {
        crate::kpi::KpiField::from_key(key).and_then(|f| values.get(f)).is_some()
    };

    let present_kpis: Vec<String> = rule
        .expected_kpis
        .iter()
        .filter(|k| has_value(&k.kpi_key))
        .map(|k| k.kpi_key.clone())
        .collect();
    let missing_required: Vec<String> = rule
        .required_kpi_keys()
        .into_iter()
        .filter(|k| !has_value(k))
        .map(|k| k.to_string())
        .collect();

    let parse_confidence = present_kpis.len() as f64 / rule.expected_kpis.len() as f64;
    let valid = missing_required.is_empty();
    if !valid {
        tracing::warn!(
            rule = %source_match.rule_id,
            missing = ?missing_required,
            present = ?present_kpis,
            "KPI validation failed"
        );
    }
    KpiValidation {
        valid,
        missing_required,
        present_kpis,
        parse_confidence,
    }
}
