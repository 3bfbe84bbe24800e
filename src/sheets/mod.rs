//! Sheet output — column layout, row serialization, and append clients.
//!
//! The column order is a stable contract with downstream dashboards; new
//! columns go at the end. Clients only know how to append raw string rows;
//! batching and retry live in [`writer`].

pub mod writer;

use std::path::PathBuf;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::{debug, info};

use crate::error::SheetError;
use crate::pipeline::types::KpiRecord;

/// Stamped into every row so downstream consumers can tell extraction
/// generations apart.
pub const EXTRACTOR_VERSION: &str = "v2.1";

/// Sheet column order. Append-only.
pub const COLUMN_ORDER: [&str; 26] = [
    "date",
    "entity",
    "revenue",
    "cash",
    "pipeline_value",
    "closings_count",
    "orders_count",
    "occupancy",
    "alerts",
    "notes",
    "run_id",
    "message_id",
    "sender",
    "subject",
    "candidate_score",
    "candidate_reasons",
    "source_type",
    "attachment_name",
    "evidence_snippet",
    "extractor_version",
    "confidence",
    "validation_flags",
    "source_rule_id",
    "source_match_score",
    "source_report_type",
    "source_parse_confidence",
];

/// Mailbox entry ids run long; the trailing segment is the unique part and
/// is what fits in a sheet cell.
pub fn short_message_id(id: &str) -> &str {
    let len = id.chars().count();
    if len <= 24 {
        return id;
    }
    let (cut, _) = id.char_indices().nth(len - 24).unwrap_or((0, ' '));
    &id[cut..]
}

fn fmt_opt_f64(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn fmt_opt_i64(v: Option<i64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

/// Serialize a record into one sheet row, in [`COLUMN_ORDER`].
pub fn record_to_row(record: &KpiRecord) -> Vec<String> {
    vec![
        record
            .date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        record.entity.clone(),
        fmt_opt_f64(record.values.revenue),
        fmt_opt_f64(record.values.cash),
        fmt_opt_f64(record.values.pipeline_value),
        fmt_opt_i64(record.values.closings_count),
        fmt_opt_i64(record.values.orders_count),
        fmt_opt_f64(record.values.occupancy),
        record.alerts.clone(),
        record.notes.clone(),
        record.run_id.clone(),
        record.message_id.clone(),
        record.sender.clone(),
        record.subject.clone(),
        record.candidate_score.to_string(),
        record.candidate_reasons.join(";"),
        record.source_type.label().to_string(),
        record.attachment_name.clone(),
        record.evidence_snippet(),
        EXTRACTOR_VERSION.to_string(),
        format!("{:.2}", record.confidence),
        record.validation_flags.clone(),
        record.source_rule_id.clone(),
        format!("{:.3}", record.source_match_score),
        record.source_report_type.clone(),
        format!("{:.2}", record.source_parse_confidence),
    ]
}

/// Destination for serialized rows.
#[async_trait]
pub trait SheetClient: Send + Sync {
    /// Append `rows` in one request. All-or-nothing per call; partial
    /// writes are the server's problem, not ours to detect.
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError>;
}

/// Google Sheets v4 append client.
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    spreadsheet_id: String,
    range: String,
    token: SecretString,
}

impl GoogleSheetsClient {
    pub fn new(spreadsheet_id: impl Into<String>, range: impl Into<String>, token: SecretString) -> Self {
        Self {
            http: reqwest::Client::new(),
            spreadsheet_id: spreadsheet_id.into(),
            range: range.into(),
            token,
        }
    }

    fn append_url(&self) -> String {
        format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values/{}:append?valueInputOption=USER_ENTERED&insertDataOption=INSERT_ROWS",
            self.spreadsheet_id, self.range
        )
    }
}

#[async_trait]
impl SheetClient for GoogleSheetsClient {
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError> {
        if rows.is_empty() {
            return Ok(());
        }
        let body = json!({ "values": rows });
        let response = self
            .http
            .post(self.append_url())
            .bearer_auth(self.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| SheetError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SheetError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SheetError::AuthFailed(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SheetError::RequestFailed(format!("HTTP {status}: {detail}")));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SheetError::InvalidResponse(e.to_string()))?;
        let updated = parsed
            .pointer("/updates/updatedRows")
            .and_then(|v| v.as_u64())
            .unwrap_or(rows.len() as u64);
        debug!(rows = rows.len(), updated, "sheet append ok");
        Ok(())
    }
}

/// Local CSV fallback for runs without sheet credentials.
pub struct CsvSheetClient {
    path: PathBuf,
}

impl CsvSheetClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SheetClient for CsvSheetClient {
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError> {
        if rows.is_empty() {
            return Ok(());
        }
        let write_header = !self.path.exists();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut wtr = csv::Writer::from_writer(file);
        if write_header {
            wtr.write_record(COLUMN_ORDER)
                .map_err(|e| SheetError::RequestFailed(e.to_string()))?;
        }
        for row in rows {
            wtr.write_record(row)
                .map_err(|e| SheetError::RequestFailed(e.to_string()))?;
        }
        wtr.flush()?;
        info!(rows = rows.len(), path = %self.path.display(), "rows appended to CSV fallback");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use crate::kpi::KpiValues;
    use crate::pipeline::types::SourceType;

    use super::*;

    fn record() -> KpiRecord {
        KpiRecord {
            entity: "Acme".into(),
            date: NaiveDate::from_ymd_opt(2026, 8, 14),
            values: KpiValues {
                revenue: Some(125_000.0),
                cash: None,
                pipeline_value: None,
                closings_count: Some(3),
                orders_count: None,
                occupancy: Some(0.92),
            },
            alerts: String::new(),
            notes: String::new(),
            run_id: "run-1".into(),
            message_id: "abc123".into(),
            sender: "reports@acme.com".into(),
            subject: "Daily KPI Report".into(),
            candidate_score: 12,
            candidate_reasons: vec!["allow_sender".into(), "kpi_attachment".into()],
            source_type: SourceType::Attachment,
            attachment_name: "daily.csv".into(),
            evidence: vec!["csv:daily.csv:row2 revenue=125000".into()],
            confidence: 0.8,
            validation_flags: String::new(),
            source_rule_id: "acme_daily".into(),
            source_match_score: 0.63,
            source_report_type: "daily_flash".into(),
            source_parse_confidence: 0.5,
        }
    }

    #[test]
    fn row_matches_column_order() {
        let row = record_to_row(&record());
        assert_eq!(row.len(), COLUMN_ORDER.len());
        assert_eq!(row[0], "2026-08-14");
        assert_eq!(row[1], "Acme");
        assert_eq!(row[2], "125000");
        assert_eq!(row[3], ""); // cash unset
        assert_eq!(row[5], "3");
        assert_eq!(row[7], "0.92");
        assert_eq!(row[15], "allow_sender;kpi_attachment");
        assert_eq!(row[16], "attachment");
        assert_eq!(row[18], "attachment: daily.csv");
        assert_eq!(row[19], EXTRACTOR_VERSION);
        assert_eq!(row[20], "0.80");
        assert_eq!(row[23], "0.630");
    }

    #[test]
    fn short_message_id_keeps_tail() {
        assert_eq!(short_message_id("short"), "short");
        let long = "0123456789abcdef0123456789abcdef";
        assert_eq!(short_message_id(long), "89abcdef0123456789abcdef");
        assert_eq!(short_message_id(long).len(), 24);
    }

    #[tokio::test]
    async fn csv_fallback_appends_with_header_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let client = CsvSheetClient::new(&path);
        client.append_rows(&[record_to_row(&record())]).await.expect("append");
        client.append_rows(&[record_to_row(&record())]).await.expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        let header_count = text.lines().filter(|l| l.starts_with("date,entity")).count();
        assert_eq!(header_count, 1);
        assert_eq!(text.lines().count(), 3);
    }
}
