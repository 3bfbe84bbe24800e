//! Per-run reporting — counters, a reasoning trace, and JSON artifacts.
//!
//! The report answers "what did this run do and why" after the fact:
//! how many messages were scanned, what got skipped for which reason, and
//! which unknown senders are waiting in quarantine for a rule to be written.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pipeline::types::{KpiRecord, Message, SkipReason};
use crate::sheets::writer::{RowResult, RowStatus};

/// A message held for triage because no source rule claimed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineItem {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    /// Best rule scores, for deciding whether a threshold tweak would fix it.
    pub top_scores: Vec<(String, f64)>,
}

/// A message that cleared the candidate filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateItem {
    pub message_id: String,
    pub sender: String,
    pub subject: String,
}

/// One line of the per-message reasoning trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub message_id: String,
    pub subject: String,
    pub outcome: String,
    pub detail: String,
}

/// Accumulated run outcome, serialized to `report.json` at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub scanned: u64,
    pub candidates: u64,
    pub extracted: u64,
    pub rows_appended: u64,
    pub rows_failed: u64,
    /// Skip counts keyed by reason label.
    pub skips: BTreeMap<String, u64>,
    pub candidate_list: Vec<CandidateItem>,
    pub quarantine: Vec<QuarantineItem>,
    pub trace: Vec<TraceEntry>,
    pub append_results: Vec<RowResult>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            finished_at: None,
            scanned: 0,
            candidates: 0,
            extracted: 0,
            rows_appended: 0,
            rows_failed: 0,
            skips: BTreeMap::new(),
            candidate_list: Vec::new(),
            quarantine: Vec::new(),
            trace: Vec::new(),
            append_results: Vec::new(),
        }
    }

    pub fn record_scanned(&mut self) {
        self.scanned += 1;
    }

    pub fn record_candidate(&mut self, msg: &Message) {
        self.candidates += 1;
        self.candidate_list.push(CandidateItem {
            message_id: msg.id.clone(),
            sender: msg.sender_email.clone(),
            subject: msg.subject.clone(),
        });
    }

    pub fn record_extracted(&mut self, msg: &Message, record: &KpiRecord) {
        self.extracted += 1;
        self.trace.push(TraceEntry {
            message_id: record.message_id.clone(),
            subject: msg.subject.clone(),
            outcome: "extracted".into(),
            detail: format!(
                "entity={} rule={} kpis={} confidence={:.2}",
                record.entity,
                record.source_rule_id,
                record.values.populated_count(),
                record.confidence
            ),
        });
    }

    pub fn record_skip(&mut self, msg: &Message, reason: &SkipReason) {
        *self.skips.entry(reason.label().to_string()).or_insert(0) += 1;
        if let SkipReason::Quarantined { top_scores } = reason {
            self.quarantine.push(QuarantineItem {
                message_id: msg.id.clone(),
                sender: msg.sender_email.clone(),
                subject: msg.subject.clone(),
                received_at: msg.received_at,
                top_scores: top_scores.clone(),
            });
        }
        let detail = match reason {
            SkipReason::AttachmentNoise { decision, detail } => {
                format!("{decision}: {detail}")
            }
            SkipReason::NotCandidate { score, reasons } => {
                format!("score={score} reasons={}", reasons.join(";"))
            }
            SkipReason::Quarantined { top_scores } | SkipReason::UnknownSourceSkipped { top_scores } => {
                top_scores
                    .iter()
                    .map(|(id, s)| format!("{id}={s:.3}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            SkipReason::MissingRequiredKpis { rule_id, missing } => {
                format!("rule={rule_id} missing={}", missing.join(";"))
            }
            SkipReason::Failed { error } => error.clone(),
            _ => String::new(),
        };
        self.trace.push(TraceEntry {
            message_id: msg.id.clone(),
            subject: msg.subject.clone(),
            outcome: reason.label().to_string(),
            detail,
        });
    }

    pub fn record_row_results(&mut self, results: &[RowResult]) {
        for r in results {
            match r.status {
                RowStatus::Appended => self.rows_appended += 1,
                RowStatus::Failed => self.rows_failed += 1,
            }
        }
        self.append_results.extend_from_slice(results);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        info!(
            run_id = %self.run_id,
            scanned = self.scanned,
            candidates = self.candidates,
            extracted = self.extracted,
            rows_appended = self.rows_appended,
            rows_failed = self.rows_failed,
            quarantined = self.quarantine.len(),
            skips = ?self.skips,
            "run complete"
        );
    }

    /// Write the artifact pack under `base/runs/<run_id>/`: `report.json`,
    /// `candidates.json`, `append_results.json`, and `quarantine.json`
    /// (the latter only when anything was held).
    pub fn write_artifacts(&self, base: &Path) -> std::io::Result<PathBuf> {
        let dir = base.join("runs").join(&self.run_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("report.json"),
            serde_json::to_string_pretty(self).unwrap_or_default(),
        )?;
        std::fs::write(
            dir.join("candidates.json"),
            serde_json::to_string_pretty(&self.candidate_list).unwrap_or_default(),
        )?;
        std::fs::write(
            dir.join("append_results.json"),
            serde_json::to_string_pretty(&self.append_results).unwrap_or_default(),
        )?;
        if !self.quarantine.is_empty() {
            std::fs::write(
                dir.join("quarantine.json"),
                serde_json::to_string_pretty(&self.quarantine).unwrap_or_default(),
            )?;
        }
        info!(dir = %dir.display(), "run artifacts written");
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use crate::pipeline::types::AttachmentMeta;

    use super::*;

    fn msg(id: &str, subject: &str) -> Message {
        Message {
            id: id.into(),
            sender_email: "x@unknown.io".into(),
            sender_name: None,
            subject: subject.into(),
            body: String::new(),
            received_at: Utc::now(),
            source_folder: "inbox".into(),
            attachments: vec![AttachmentMeta::from_name("r.csv", 10)],
        }
    }

    #[test]
    fn skip_counters_and_quarantine_list() {
        let mut report = RunReport::new("run-1");
        let m = msg("m1", "weird report");
        report.record_scanned();
        report.record_skip(
            &m,
            &SkipReason::Quarantined {
                top_scores: vec![("acme_daily".into(), 0.31)],
            },
        );
        report.record_skip(&msg("m2", "dup"), &SkipReason::AlreadyProcessed);
        report.record_skip(&msg("m3", "dup"), &SkipReason::AlreadyProcessed);

        assert_eq!(report.skips.get("quarantined"), Some(&1));
        assert_eq!(report.skips.get("already_processed"), Some(&2));
        assert_eq!(report.quarantine.len(), 1);
        assert_eq!(report.quarantine[0].message_id, "m1");
        assert_eq!(report.trace.len(), 3);
    }

    #[test]
    fn artifacts_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut report = RunReport::new("run-xyz");
        report.record_scanned();
        report.record_skip(
            &msg("m1", "s"),
            &SkipReason::Quarantined { top_scores: vec![] },
        );
        report.finish();

        let out = report.write_artifacts(dir.path()).expect("write");
        assert!(out.join("report.json").exists());
        assert!(out.join("candidates.json").exists());
        assert!(out.join("append_results.json").exists());
        assert!(out.join("quarantine.json").exists());

        let text = std::fs::read_to_string(out.join("report.json")).expect("read");
        let parsed: RunReport = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed.run_id, "run-xyz");
        assert_eq!(parsed.scanned, 1);
        assert!(parsed.finished_at.is_some());
    }
}
