//! Extraction merge engine — combines attachment cells, body-regex hits,
//! and (conditionally) LLM estimates into one set of KPI values.
//!
//! Precedence per field: attachment value first, body regex fills gaps,
//! LLM merges last. LLM values override regex values on disagreement since
//! the model sees full-document context, but they are discarded below a
//! confidence floor and subjected to sanity bounds (minimum monetary
//! magnitude, no bare calendar years). Every accepted value carries an
//! evidence string naming its origin.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::{debug, info};

use crate::docs::DocumentRow;
use crate::kpi::{KpiField, KpiValues, match_label, parse_field_value, synonyms_for};
use crate::llm::{LlmExtraction, MIN_CONFIDENCE};

use super::suitability::Tier;
use super::types::SourceType;

/// Monetary LLM values below this are rejected as noise.
const MIN_MONETARY_VALUE: f64 = 100.0;

static LABEL_VALUE_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[:\-=]\s*").expect("static regex"));

static DOLLAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*[\d,]+").expect("static regex"));
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?\s*%").expect("static regex"));

static DEAL_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(loi|letter of intent|term sheet|purchase (and sale|price|agreement)|acquisition|acquiring|divestiture|offering memorandum|due diligence)\b",
    )
    .expect("static regex")
});

/// Per-field body patterns built from the synonym table: label, optional
/// separator, then the nearest following numeric token.
static BODY_PATTERNS: LazyLock<HashMap<KpiField, Regex>> = LazyLock::new(|| {
    KpiField::ALL
        .iter()
        .map(|&field| {
            let mut synonyms: Vec<String> =
                synonyms_for(field).iter().map(|s| regex::escape(s)).collect();
            // Longest first so alternation prefers "occupancy rate" over "occ".
            synonyms.sort_by_key(|s| std::cmp::Reverse(s.len()));
            let group = synonyms.join("|");
            let pattern = if field == KpiField::Occupancy {
                format!(r"(?:{group})\s*[:=\-]?\s*(\d+\.?\d*\s*%?)")
            } else if field.is_count() {
                format!(r"(?:{group})\s*[:=\-]?\s*(\d+)")
            } else {
                format!(r"(?:{group})\s*[:=\-]?\s*\$?([\d,\.kKmMbB]+)")
            };
            let re = RegexBuilder::new(&pattern)
                .case_insensitive(true)
                .build()
                .expect("synonym patterns are static");
            (field, re)
        })
        .collect()
});

// ── Attachment cell scanning ────────────────────────────────────────

/// Walk rows left to right; when a cell matches a KPI label, take the value
/// from the same cell after a separator ("Revenue: $1,234") or from the
/// nearest of the next three cells. First hit per field wins.
pub fn scan_rows(rows: &[DocumentRow], values: &mut KpiValues, evidence: &mut Vec<String>) {
    for row in rows {
        for (i, cell) in row.cells.iter().enumerate() {
            let cell = cell.trim();
            if cell.is_empty() {
                continue;
            }

            // Same-cell label/value pair.
            let mut split = LABEL_VALUE_SPLIT_RE.splitn(cell, 2);
            if let (Some(label), Some(rest)) = (split.next(), split.next()) {
                if let Some(field) = match_label(label) {
                    if values.get(field).is_none() {
                        if let Some(val) = parse_field_value(rest.trim(), field) {
                            values.set(field, val);
                            evidence.push(format!(
                                "{} cell[{i}] '{cell}' -> {}={val}",
                                row.source,
                                field.key()
                            ));
                            debug!(field = field.key(), value = val, source = %row.source, "KPI hit");
                            continue;
                        }
                    }
                }
            }

            let Some(field) = match_label(cell) else {
                continue;
            };
            if values.get(field).is_some() {
                continue;
            }
            // Label cell; look right for the nearest numeric value.
            for j in (i + 1)..row.cells.len().min(i + 4) {
                let candidate = row.cells[j].trim();
                if let Some(val) = parse_field_value(candidate, field) {
                    values.set(field, val);
                    evidence.push(format!(
                        "{} cell[{i}]->cell[{j}] '{cell}'->'{candidate}' -> {}={val}",
                        row.source,
                        field.key()
                    ));
                    debug!(field = field.key(), value = val, source = %row.source, "KPI hit");
                    break;
                }
            }
        }
    }
}

// ── Body-text regex extraction ──────────────────────────────────────

/// Fill gaps in `values` from body text using the synonym patterns.
pub fn extract_from_body(body: &str, values: &mut KpiValues, evidence: &mut Vec<String>) {
    for field in KpiField::ALL {
        if values.get(field).is_some() {
            continue;
        }
        let Some(caps) = BODY_PATTERNS[&field].captures(body) else {
            continue;
        };
        let raw = caps[1].trim().to_string();
        if let Some(val) = parse_field_value(&raw, field) {
            values.set(field, val);
            evidence.push(format!("body regex '{}' matched '{raw}'", field.key()));
        }
    }
}

// ── LLM gating ──────────────────────────────────────────────────────

/// Document-level gate: Tier 1 always, Tier 2 only when regex found at
/// most one KPI.
pub fn should_invoke_llm_for_document(tier: Tier, regex_kpi_count: usize) -> bool {
    match tier {
        Tier::One => true,
        Tier::Two => regex_kpi_count <= 1,
        Tier::Three | Tier::Four => false,
    }
}

/// Body-text gate: at least two of {dollar amount, percentage, KPI
/// keyword} present.
pub fn body_has_financial_signal(body: &str, kpi_terms: &[String]) -> bool {
    let lower = body.to_lowercase();
    let mut signals = 0;
    if DOLLAR_RE.is_match(body) {
        signals += 1;
    }
    if PERCENT_RE.is_match(body) {
        signals += 1;
    }
    if kpi_terms.iter().any(|t| lower.contains(t.as_str())) {
        signals += 1;
    }
    signals >= 2
}

/// Subject guard: deal-discussion threads describe third-party numbers,
/// not the sender's operating metrics.
pub fn is_deal_discussion_subject(subject: &str) -> bool {
    DEAL_SUBJECT_RE.is_match(subject)
}

// ── LLM merge ───────────────────────────────────────────────────────

/// Merge an LLM extraction into regex-derived values.
///
/// Adoption rules per field: LLM fills gaps, overrides on disagreement,
/// and is ignored when its confidence is below [`MIN_CONFIDENCE`] or the
/// value fails sanity bounds. Agreements and kept-regex cases are still
/// logged to the evidence trail for audit.
pub fn merge_llm(
    values: &mut KpiValues,
    llm: &LlmExtraction,
    evidence: &mut Vec<String>,
    source: &str,
) {
    for field in KpiField::ALL {
        let entry = llm.get(field);
        if entry.confidence < MIN_CONFIDENCE {
            if entry.value.is_some() {
                debug!(
                    field = field.key(),
                    confidence = entry.confidence,
                    "skipping low-confidence LLM value"
                );
            }
            continue;
        }

        let llm_val = entry.value;
        if let Some(v) = llm_val {
            let monetary = matches!(
                field,
                KpiField::Revenue | KpiField::Cash | KpiField::PipelineValue
            );
            if monetary && v.abs() < MIN_MONETARY_VALUE {
                debug!(field = field.key(), value = v, "rejecting LLM value below minimum magnitude");
                continue;
            }
            if monetary && (1900.0..=2099.0).contains(&v) && v.fract() == 0.0 {
                debug!(field = field.key(), value = v, "rejecting LLM value that looks like a year");
                continue;
            }
        }

        let regex_val = values.get(field);
        let llm_evidence = entry.evidence_line.as_deref().unwrap_or("");
        match (regex_val, llm_val) {
            (Some(r), None) => {
                evidence.push(format!("LLM:{source} {}=null (regex kept {r})", field.key()));
            }
            (None, None) => {}
            (None, Some(v)) => {
                values.set(field, v);
                evidence.push(format!(
                    "LLM:{source} {}={v} (NEW, conf={:.2}, evidence='{llm_evidence}')",
                    field.key(),
                    entry.confidence
                ));
                info!(field = field.key(), value = v, confidence = entry.confidence, "LLM new KPI");
            }
            (Some(r), Some(v)) if (r - v).abs() > 1e-6 => {
                values.set(field, v);
                evidence.push(format!(
                    "LLM:{source} {}={v} OVERRIDE regex={r} (conf={:.2}, evidence='{llm_evidence}')",
                    field.key(),
                    entry.confidence
                ));
                info!(field = field.key(), regex = r, llm = v, "LLM override");
            }
            (Some(_), Some(v)) => {
                evidence.push(format!(
                    "LLM:{source} {}={v} AGREES with regex (conf={:.2})",
                    field.key(),
                    entry.confidence
                ));
            }
        }
    }
}

// ── Confidence ──────────────────────────────────────────────────────

/// Overall record confidence: attachment-backed values score higher than
/// body-only, each additional populated field adds a little, an LLM pass
/// adds a little more. Clamped to [0.05, 0.95] so no record ever claims
/// certainty either way.
pub fn compute_confidence(values: &KpiValues, source_type: SourceType, llm_used: bool) -> f64 {
    let base = match source_type {
        SourceType::Attachment => 0.6,
        SourceType::Body => 0.4,
    };
    let populated = values.populated_count() as f64;
    let mut confidence = base + 0.05 * populated;
    if llm_used {
        confidence += 0.05;
    }
    confidence.clamp(0.05, 0.95)
}

#[cfg(test)]
mod tests {
    use crate::llm::FieldEstimate;

    use super::*;

    fn row(source: &str, cells: &[&str]) -> DocumentRow {
        DocumentRow {
            source: source.into(),
            cells: cells.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[test]
    fn scan_finds_value_to_the_right() {
        let rows = vec![row("csv:daily.csv:row2", &["Revenue", "$125,000"])];
        let mut values = KpiValues::default();
        let mut evidence = Vec::new();
        scan_rows(&rows, &mut values, &mut evidence);
        assert_eq!(values.revenue, Some(125_000.0));
        assert!(evidence[0].contains("csv:daily.csv:row2"));
        assert!(evidence[0].contains("revenue=125000"));
    }

    #[test]
    fn scan_finds_same_cell_pair() {
        let rows = vec![row("pdf:r.pdf:line3", &["Revenue: $125,000"])];
        let mut values = KpiValues::default();
        let mut evidence = Vec::new();
        scan_rows(&rows, &mut values, &mut evidence);
        assert_eq!(values.revenue, Some(125_000.0));
    }

    #[test]
    fn scan_skips_cells_up_to_three_away() {
        let rows = vec![row("x:row1", &["Occupancy", "", "n/a", "92%"])];
        let mut values = KpiValues::default();
        let mut evidence = Vec::new();
        scan_rows(&rows, &mut values, &mut evidence);
        assert_eq!(values.occupancy, Some(0.92));

        // Four cells away is out of reach.
        let rows = vec![row("x:row1", &["Cash", "", "", "", "500"])];
        let mut values = KpiValues::default();
        scan_rows(&rows, &mut values, &mut Vec::new());
        assert_eq!(values.cash, None);
    }

    #[test]
    fn scan_first_hit_wins() {
        let rows = vec![
            row("x:row1", &["Revenue", "100"]),
            row("x:row2", &["Revenue", "200"]),
        ];
        let mut values = KpiValues::default();
        scan_rows(&rows, &mut values, &mut Vec::new());
        assert_eq!(values.revenue, Some(100.0));
    }

    #[test]
    fn body_regex_fills_gaps_only() {
        let mut values = KpiValues::default();
        values.revenue = Some(1.0);
        let mut evidence = Vec::new();
        extract_from_body(
            "Revenue: $999,999\nCash balance - $300k\nOccupancy: 92%\nClosings: 12",
            &mut values,
            &mut evidence,
        );
        // Attachment value untouched, gaps filled.
        assert_eq!(values.revenue, Some(1.0));
        assert_eq!(values.cash, Some(300_000.0));
        assert_eq!(values.occupancy, Some(0.92));
        assert_eq!(values.closings_count, Some(12));
        assert!(evidence.iter().any(|e| e.contains("body regex 'cash'")));
    }

    #[test]
    fn llm_gates() {
        assert!(should_invoke_llm_for_document(Tier::One, 6));
        assert!(should_invoke_llm_for_document(Tier::Two, 1));
        assert!(!should_invoke_llm_for_document(Tier::Two, 2));
        assert!(!should_invoke_llm_for_document(Tier::Four, 0));

        let terms = vec!["revenue".to_string()];
        assert!(body_has_financial_signal("revenue came in at $125,000", &terms));
        assert!(body_has_financial_signal("up 12% to $5,000", &terms));
        assert!(!body_has_financial_signal("lunch on friday", &terms));
        assert!(!body_has_financial_signal("revenue discussion tomorrow", &terms));

        assert!(is_deal_discussion_subject("RE: LOI for Westside portfolio"));
        assert!(is_deal_discussion_subject("Acquisition term sheet"));
        assert!(!is_deal_discussion_subject("Daily KPI report"));
    }

    fn estimate(value: Option<f64>, confidence: f64) -> FieldEstimate {
        FieldEstimate {
            value,
            evidence_line: Some("line".into()),
            confidence,
        }
    }

    #[test]
    fn llm_overrides_regex_on_disagreement() {
        let mut values = KpiValues::default();
        values.revenue = Some(125.0);
        let llm = LlmExtraction {
            revenue: estimate(Some(125_000.0), 0.9),
            ..Default::default()
        };
        let mut evidence = Vec::new();
        merge_llm(&mut values, &llm, &mut evidence, "pdf");
        assert_eq!(values.revenue, Some(125_000.0));
        assert!(evidence[0].contains("OVERRIDE"));
    }

    #[test]
    fn llm_below_confidence_floor_ignored() {
        let mut values = KpiValues::default();
        let llm = LlmExtraction {
            revenue: estimate(Some(125_000.0), 0.5),
            ..Default::default()
        };
        merge_llm(&mut values, &llm, &mut Vec::new(), "pdf");
        assert_eq!(values.revenue, None);
    }

    #[test]
    fn llm_sanity_bounds() {
        let mut values = KpiValues::default();
        let llm = LlmExtraction {
            revenue: estimate(Some(50.0), 0.9),  // below minimum magnitude
            cash: estimate(Some(2024.0), 0.9),   // bare year
            pipeline_value: estimate(Some(2024.5), 0.9), // not a bare year
            ..Default::default()
        };
        merge_llm(&mut values, &llm, &mut Vec::new(), "pdf");
        assert_eq!(values.revenue, None);
        assert_eq!(values.cash, None);
        assert_eq!(values.pipeline_value, Some(2024.5));
    }

    #[test]
    fn llm_null_keeps_regex_value() {
        let mut values = KpiValues::default();
        values.cash = Some(300_000.0);
        let llm = LlmExtraction {
            cash: estimate(None, 0.9),
            ..Default::default()
        };
        let mut evidence = Vec::new();
        merge_llm(&mut values, &llm, &mut evidence, "body");
        assert_eq!(values.cash, Some(300_000.0));
        assert!(evidence[0].contains("regex kept"));
    }

    #[test]
    fn llm_agreement_logged() {
        let mut values = KpiValues::default();
        values.occupancy = Some(0.92);
        let llm = LlmExtraction {
            occupancy: estimate(Some(0.92), 0.9),
            ..Default::default()
        };
        let mut evidence = Vec::new();
        merge_llm(&mut values, &llm, &mut evidence, "pdf");
        assert_eq!(values.occupancy, Some(0.92));
        assert!(evidence[0].contains("AGREES"));
    }

    #[test]
    fn confidence_orders_sources() {
        let mut values = KpiValues::default();
        values.revenue = Some(1000.0);
        let att = compute_confidence(&values, SourceType::Attachment, false);
        let body = compute_confidence(&values, SourceType::Body, false);
        assert!(att > body);
        assert!(att > 0.0 && att < 1.0);

        values.cash = Some(500.0);
        let more = compute_confidence(&values, SourceType::Attachment, false);
        assert!(more > att);
    }
}
