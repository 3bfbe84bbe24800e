//! Shared types for the extraction pipeline.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::kpi::KpiValues;

// ── Inbound message ─────────────────────────────────────────────────

/// Immutable input unit, produced by a mail store.
///
/// Read-only to the pipeline; everything derived from it (gate decisions,
/// match scores, extracted records) lives in separate types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable message id (mailbox entry id or Message-ID header).
    pub id: String,
    /// Raw sender address as the mail store reported it.
    pub sender_email: String,
    /// Human-readable sender name, if available.
    pub sender_name: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Folder the message came from ("inbox", "sent items", "junk email").
    #[serde(default)]
    pub source_folder: String,
    /// Attachment metadata (bytes are materialized lazily by the mail store).
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
}

impl Message {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Semicolon-joined attachment names, for logs and sheet rows.
    pub fn attachment_names(&self) -> String {
        self.attachments
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Per-attachment metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    /// Original filename.
    pub name: String,
    /// Lowercased extension including the dot (".pdf"), empty if none.
    pub ext: String,
    /// Size in bytes (0 when unknown).
    pub size: u64,
    /// On-disk path once the mail store has saved the bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl AttachmentMeta {
    /// Build metadata from a filename, deriving the extension.
    pub fn from_name(name: &str, size: u64) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            ext,
            size,
            path: None,
        }
    }
}

// ── Extraction output ───────────────────────────────────────────────

/// Where the primary extraction evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Attachment,
    Body,
}

impl SourceType {
    pub fn label(&self) -> &'static str {
        match self {
            SourceType::Attachment => "attachment",
            SourceType::Body => "body",
        }
    }
}

/// Canonical output row — one per accepted message, written once to the sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiRecord {
    pub entity: String,
    /// Reporting date (defaults to the received date).
    pub date: Option<NaiveDate>,
    pub values: KpiValues,
    /// Anomaly alerts, semicolon-joined (empty when clean).
    pub alerts: String,
    pub notes: String,
    pub run_id: String,
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub candidate_score: i32,
    pub candidate_reasons: Vec<String>,
    pub source_type: SourceType,
    pub attachment_name: String,
    /// Provenance trail, one string per contributing source.
    pub evidence: Vec<String>,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    pub validation_flags: String,
    pub source_rule_id: String,
    pub source_match_score: f64,
    pub source_report_type: String,
    /// Coverage of the matched rule's expected KPIs, in [0, 1].
    pub source_parse_confidence: f64,
}

impl KpiRecord {
    /// Short evidence string for the sheet (first item, truncated).
    pub fn evidence_snippet(&self) -> String {
        if self.source_type == SourceType::Attachment && !self.attachment_name.is_empty() {
            return format!("attachment: {}", self.attachment_name);
        }
        let joined = self.evidence.join("; ");
        joined.chars().take(120).collect()
    }
}

// ── Skip reasons ────────────────────────────────────────────────────

/// Why a message produced no sheet row.
///
/// Every stage returns one of these instead of throwing; the orchestrator's
/// loop is a plain match over `Result<KpiRecord, SkipReason>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// Ledger hit — already committed in a previous run.
    AlreadyProcessed,
    /// Attachment gate classified the message as noise.
    AttachmentNoise { decision: String, detail: String },
    /// Candidate score below threshold (or deny-listed sender).
    NotCandidate { score: i32, reasons: Vec<String> },
    /// No source rule met its threshold; held for triage.
    Quarantined { top_scores: Vec<(String, f64)> },
    /// No source rule met its threshold; dropped per configured policy.
    UnknownSourceSkipped { top_scores: Vec<(String, f64)> },
    /// Extraction produced no KPI values under the require-KPI policy.
    NoKpiValues,
    /// A required KPI declared by the matched rule was missing.
    MissingRequiredKpis { rule_id: String, missing: Vec<String> },
    /// Unrecoverable per-message failure (recorded, never fatal to the run).
    Failed { error: String },
}

impl SkipReason {
    /// Short label for counters and logs.
    pub fn label(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already_processed",
            SkipReason::AttachmentNoise { .. } => "attachment_noise",
            SkipReason::NotCandidate { .. } => "not_candidate",
            SkipReason::Quarantined { .. } => "quarantined",
            SkipReason::UnknownSourceSkipped { .. } => "unknown_source_skipped",
            SkipReason::NoKpiValues => "no_kpi_values",
            SkipReason::MissingRequiredKpis { .. } => "missing_required_kpis",
            SkipReason::Failed { .. } => "failed",
        }
    }
}
