//! Document suitability scoring — the content-based gate that runs before
//! expensive KPI extraction.
//!
//! Documents are tiered:
//!   Tier 1  score >= 6, no reject hits    high-confidence KPI document
//!   Tier 2  score 4-5 (or plain 3)        likely KPI document
//!   Tier 3  scanned / ambiguous PDF       OCR candidate, re-scored once
//!   Tier 4  reject hit or score <= 2      skip
//!
//! Every signal is a deterministic heuristic; no network calls. Tier-3
//! documents are re-scored after OCR; if OCR yields no usable text they are
//! downgraded to Tier 4.

use std::sync::LazyLock;

use chrono::{Duration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

const TIME_RELEVANCE_TERMS: [&str; 9] = [
    "today",
    "current",
    "mtd",
    "month to date",
    "daily report",
    "weekly snapshot",
    "week ending",
    "as of",
    "reporting period",
];

const KPI_LABEL_TERMS: [&str; 8] = [
    "revenue",
    "cash balance",
    "bank balance",
    "pipeline",
    "occupancy",
    "census",
    "closings",
    "orders",
];

const AGGREGATED_TOTALS_TERMS: [&str; 5] =
    ["total", "summary", "grand total", "mtd total", "ytd total"];

/// Keyword families that force Tier 4 regardless of positive score
/// (deal documents, legal instruments, pro-formas).
const REJECT_KEYWORDS: [&str; 17] = [
    "pro forma",
    "proforma",
    "irr",
    "waterfall",
    "offering",
    "equity raise",
    "capex budget",
    "replacement cost",
    "investment memorandum",
    "loan document",
    "change order",
    "tax bill",
    "hr agreement",
    "nda",
    "agenda",
    "purchase and sale agreement",
    "operations transfer agreement",
];

const EXCEL_ACCEPT_SHEETNAMES: [&str; 6] =
    ["summary", "dashboard", "kpi", "mtd", "report", "census"];

const EXCEL_REJECT_SHEETNAMES: [&str; 7] = [
    "proforma",
    "pro forma",
    "waterfall",
    "irr",
    "underwriting",
    "model",
    "sensitivity",
];

/// Filename hints that mark an empty-text PDF as a scanned report worth OCR.
const PDF_REPORT_FILENAME_HINTS: [&str; 14] = [
    "census",
    "snapshot",
    "dashboard",
    "balance",
    "production",
    "report",
    "kpi",
    "occupancy",
    "daily",
    "weekly",
    "monthly",
    "summary",
    "revenue",
    "cash",
];

static DATE_MDY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[/\-](\d{1,2})[/\-](20\d{2})\b").expect("static regex")
});
static DATE_YMD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(20\d{2})[/\-](\d{1,2})[/\-](\d{1,2})\b").expect("static regex")
});
static DATE_MONTH_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(January|February|March|April|May|June|July|August|September|October|November|December|Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)\s+(\d{1,2}),?\s+(20\d{2})\b",
    )
    .expect("static regex")
});
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*\.?\d*").expect("static regex"));
static DELIMITER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\t|]| {2,}").expect("static regex"));

/// Suitability tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    One = 1,
    Two = 2,
    Three = 3,
    Four = 4,
}

/// Suitability verdict for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuitabilityResult {
    pub score: i32,
    pub tier: Tier,
    pub accept: bool,
    pub reasons: Vec<String>,
    pub reject_hits: Vec<String>,
    /// True when the document should go through OCR and be re-scored.
    pub ocr_candidate: bool,
}

/// Inputs beyond the extracted text itself.
#[derive(Debug, Clone, Default)]
pub struct DocumentHints<'a> {
    pub filename: &'a str,
    /// Excel sheet names, when the document is a workbook.
    pub sheetnames: &'a [String],
    pub is_pdf: bool,
    /// Normal text extraction yielded nothing (scanned PDF suspect).
    pub text_is_empty: bool,
}

fn month_number(name: &str) -> Option<u32> {
    let n = match name.to_lowercase().as_str() {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(n)
}

/// True if `text` mentions a calendar date within the last `within_days`.
fn has_recent_date(text: &str, within_days: i64) -> bool {
    let today = Utc::now().date_naive();
    let cutoff = today - Duration::days(within_days);
    let in_window = |d: NaiveDate| d >= cutoff && d <= today + Duration::days(1);

    for caps in DATE_MDY_RE.captures_iter(text) {
        if let (Ok(m), Ok(d), Ok(y)) = (caps[1].parse(), caps[2].parse(), caps[3].parse()) {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                if in_window(date) {
                    return true;
                }
            }
        }
    }
    for caps in DATE_YMD_RE.captures_iter(text) {
        if let (Ok(y), Ok(m), Ok(d)) = (caps[1].parse(), caps[2].parse(), caps[3].parse()) {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                if in_window(date) {
                    return true;
                }
            }
        }
    }
    for caps in DATE_MONTH_NAME_RE.captures_iter(text) {
        if let (Some(m), Ok(d), Ok(y)) = (month_number(&caps[1]), caps[2].parse(), caps[3].parse())
        {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                if in_window(date) {
                    return true;
                }
            }
        }
    }
    false
}

/// Table-shape heuristic: at least 3 lines each carrying >= 2 numbers and
/// column delimiters (tabs, pipes, or runs of spaces).
fn looks_tabular(text: &str) -> bool {
    let mut tabular_lines = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let nums = NUMBER_RE.find_iter(line).count();
        if nums >= 2 && DELIMITER_RE.is_match(line) {
            tabular_lines += 1;
            if tabular_lines >= 3 {
                return true;
            }
        }
    }
    false
}

/// A time-relevance term plus at least two KPI labels reads like an
/// MTD snapshot.
fn mtd_snapshot_heuristic(text_lower: &str) -> bool {
    let has_time = TIME_RELEVANCE_TERMS.iter().any(|t| text_lower.contains(t));
    let kpi_count = KPI_LABEL_TERMS.iter().filter(|t| text_lower.contains(*t)).count();
    has_time && kpi_count >= 2
}

/// Score a document's suitability for KPI extraction.
pub fn compute_suitability(text: &str, hints: &DocumentHints) -> SuitabilityResult {
    let mut score = 0i32;
    let mut reasons: Vec<String> = Vec::new();
    let mut reject_hits: Vec<String> = Vec::new();
    let text_lower = text.to_lowercase();
    let filename_lower = hints.filename.to_lowercase();

    for kw in REJECT_KEYWORDS {
        if text_lower.contains(kw) {
            reject_hits.push(kw.to_string());
        }
    }

    if !hints.sheetnames.is_empty() {
        let sheets_lower: Vec<String> =
            hints.sheetnames.iter().map(|s| s.to_lowercase()).collect();
        // Award the sheet-name bonus once.
        if let Some(hit) = EXCEL_ACCEPT_SHEETNAMES
            .iter()
            .find(|a| sheets_lower.iter().any(|sl| sl.contains(*a)))
        {
            score += 2;
            reasons.push(format!("+2 excel accept sheetname contains '{hit}'"));
        }
        for rej in EXCEL_REJECT_SHEETNAMES {
            if sheets_lower.iter().any(|sl| sl.contains(rej)) {
                reject_hits.push(format!("excel sheet '{rej}'"));
            }
        }
    }

    let time_hits: Vec<&str> = TIME_RELEVANCE_TERMS
        .iter()
        .filter(|t| text_lower.contains(**t))
        .copied()
        .collect();
    if !time_hits.is_empty() {
        score += 2;
        reasons.push(format!("+2 time relevance: {}", time_hits[..time_hits.len().min(3)].join(", ")));
    }

    if has_recent_date(text, 7) {
        score += 2;
        reasons.push("+2 recent reporting date detected".into());
    }

    let kpi_hits: Vec<&str> = KPI_LABEL_TERMS
        .iter()
        .filter(|t| text_lower.contains(**t))
        .copied()
        .collect();
    if !kpi_hits.is_empty() {
        score += 2;
        reasons.push(format!("+2 KPI labels: {}", kpi_hits[..kpi_hits.len().min(4)].join(", ")));
    }

    let total_hits: Vec<&str> = AGGREGATED_TOTALS_TERMS
        .iter()
        .filter(|t| text_lower.contains(**t))
        .copied()
        .collect();
    if !total_hits.is_empty() {
        score += 1;
        reasons.push(format!("+1 aggregated totals: {}", total_hits[..total_hits.len().min(3)].join(", ")));
    }

    if looks_tabular(text) {
        score += 1;
        reasons.push("+1 looks tabular (multiple numbers + delimiters)".into());
    }

    if mtd_snapshot_heuristic(&text_lower) {
        score += 2;
        reasons.push("+2 MTD snapshot heuristic (time term + >=2 KPI labels)".into());
    }

    let mut ocr_candidate = false;
    let (tier, accept) = if !reject_hits.is_empty() {
        reasons.push(format!("REJECT: hard-reject keywords: {}", reject_hits.join(", ")));
        (Tier::Four, false)
    } else if score >= 6 {
        (Tier::One, true)
    } else if (4..=5).contains(&score) {
        (Tier::Two, true)
    } else if hints.is_pdf && hints.text_is_empty {
        // Scanned PDF with no text; look at the filename before giving up.
        let fn_hints: Vec<&str> = PDF_REPORT_FILENAME_HINTS
            .iter()
            .filter(|h| filename_lower.contains(**h))
            .copied()
            .collect();
        if !fn_hints.is_empty() {
            ocr_candidate = true;
            reasons.push(format!("Tier 3: scanned PDF, filename hints: {}", fn_hints.join(", ")));
            (Tier::Three, false)
        } else if score >= 3 {
            ocr_candidate = true;
            reasons.push("Tier 3: scanned PDF suspected, score >= 3".into());
            (Tier::Three, false)
        } else {
            reasons.push("Tier 4: scanned PDF with no filename hints and low score".into());
            (Tier::Four, false)
        }
    } else if hints.is_pdf && (3..=5).contains(&score) {
        let fn_hints: Vec<&str> = PDF_REPORT_FILENAME_HINTS
            .iter()
            .filter(|h| filename_lower.contains(**h))
            .copied()
            .collect();
        if !fn_hints.is_empty() {
            ocr_candidate = true;
            reasons.push(format!(
                "Tier 3: PDF with filename hints: {}, score={score}",
                fn_hints.join(", ")
            ));
            (Tier::Three, false)
        } else if score >= 4 {
            (Tier::Two, true)
        } else {
            (Tier::Four, false)
        }
    } else if score <= 2 {
        reasons.push(format!("Tier 4: score={score} too low"));
        (Tier::Four, false)
    } else {
        // Score of exactly 3 with no PDF special handling.
        (Tier::Two, true)
    };

    info!(
        file = %if hints.filename.is_empty() { "(text)" } else { hints.filename },
        tier = tier as i32,
        score,
        accept,
        ocr_candidate,
        "suitability scored"
    );

    SuitabilityResult {
        score,
        tier,
        accept,
        reasons,
        reject_hits,
        ocr_candidate,
    }
}

/// Re-score a Tier-3 document after OCR.
///
/// No usable OCR text downgrades straight to Tier 4; otherwise the document
/// gets one fresh scoring pass over the OCR output, with the OCR path
/// disabled so it cannot loop.
pub fn rescore_after_ocr(ocr_text: &str, hints: &DocumentHints) -> SuitabilityResult {
    if ocr_text.trim().is_empty() {
        return SuitabilityResult {
            score: 0,
            tier: Tier::Four,
            accept: false,
            reasons: vec!["Tier 4: OCR produced no usable text".into()],
            reject_hits: vec![],
            ocr_candidate: false,
        };
    }
    let rescore_hints = DocumentHints {
        filename: hints.filename,
        sheetnames: hints.sheetnames,
        is_pdf: false,
        text_is_empty: false,
    };
    compute_suitability(ocr_text, &rescore_hints)
}
