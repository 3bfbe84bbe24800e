//! Document decoding — per-format extraction behind a single dispatch.
//!
//! Each supported format gets one decode path selected once by extension
//! (`DocumentKind`), producing both row-oriented cells for label scanning
//! and flat text for suitability scoring. Decoding runs on the blocking
//! pool under a hard timeout so a pathological PDF cannot stall a run.

pub mod ocr;

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use calamine::{Data, Reader, open_workbook_auto};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DocumentError;

/// Embedded text shorter than this marks a PDF as likely scanned.
pub const MIN_TEXT_LENGTH: usize = 200;

/// Hard ceiling on a single document decode.
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);

static PDF_CELL_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[:\t|]+").expect("static regex"));

/// Supported document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Csv,
    Xlsx,
    Xls,
    Pdf,
}

impl DocumentKind {
    /// Select a decoder from a lowercased extension (with dot).
    pub fn from_ext(ext: &str) -> Option<Self> {
        match ext {
            ".csv" => Some(DocumentKind::Csv),
            ".xlsx" => Some(DocumentKind::Xlsx),
            ".xls" => Some(DocumentKind::Xls),
            ".pdf" => Some(DocumentKind::Pdf),
            _ => None,
        }
    }

    /// Parse priority when a message carries several attachments; lower
    /// parses first (structured formats before PDFs).
    pub fn priority(&self) -> u8 {
        match self {
            DocumentKind::Csv => 1,
            DocumentKind::Xlsx => 2,
            DocumentKind::Xls => 3,
            DocumentKind::Pdf => 4,
        }
    }
}

/// One row of cells plus its provenance string, e.g.
/// `csv:daily.csv:row2` or `xlsx:book.xlsx:Summary:row3`.
#[derive(Debug, Clone)]
pub struct DocumentRow {
    pub source: String,
    pub cells: Vec<String>,
}

/// Decoded document content.
#[derive(Debug, Clone)]
pub struct DocumentContent {
    pub kind: DocumentKind,
    pub rows: Vec<DocumentRow>,
    /// Flat text for suitability scoring.
    pub text: String,
    /// Workbook sheet names (empty for other formats).
    pub sheetnames: Vec<String>,
    /// PDF whose embedded text was too short to trust (OCR suspect).
    pub looks_scanned: bool,
}

/// Decode a document with the default timeout.
pub async fn decode(path: &Path, kind: DocumentKind) -> Result<DocumentContent, DocumentError> {
    decode_with_timeout(path, kind, EXTRACT_TIMEOUT).await
}

/// Decode a document, bounding the blocking parse with `timeout`.
pub async fn decode_with_timeout(
    path: &Path,
    kind: DocumentKind,
    timeout: Duration,
) -> Result<DocumentContent, DocumentError> {
    let name = file_name(path);
    let owned = path.to_path_buf();
    let task = tokio::task::spawn_blocking(move || decode_blocking(&owned, kind));
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.map_err(|e| DocumentError::Decode {
            name: name.clone(),
            reason: format!("decode task panicked: {e}"),
        })?,
        Err(_) => Err(DocumentError::Timeout { name, timeout }),
    }
}

fn decode_blocking(path: &Path, kind: DocumentKind) -> Result<DocumentContent, DocumentError> {
    let name = file_name(path);
    debug!(file = %name, kind = ?kind, "decoding document");
    match kind {
        DocumentKind::Csv => decode_csv(path, &name),
        DocumentKind::Xlsx | DocumentKind::Xls => decode_workbook(path, &name, kind),
        DocumentKind::Pdf => decode_pdf(path, &name),
    }
}

fn decode_csv(path: &Path, name: &str) -> Result<DocumentContent, DocumentError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| DocumentError::Decode {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    let mut rows = Vec::new();
    let mut text = String::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| DocumentError::Decode {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let cells: Vec<String> = record.iter().map(|c| c.to_string()).collect();
        text.push_str(&cells.join("\t"));
        text.push('\n');
        rows.push(DocumentRow {
            source: format!("csv:{name}:row{}", idx + 1),
            cells,
        });
    }
    Ok(DocumentContent {
        kind: DocumentKind::Csv,
        rows,
        text,
        sheetnames: vec![],
        looks_scanned: false,
    })
}

fn decode_workbook(
    path: &Path,
    name: &str,
    kind: DocumentKind,
) -> Result<DocumentContent, DocumentError> {
    let mut wb = open_workbook_auto(path).map_err(|e| DocumentError::Decode {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let sheetnames: Vec<String> = wb.sheet_names().to_owned();

    let mut rows = Vec::new();
    let mut text = String::new();
    for sheet in &sheetnames {
        let range = match wb.worksheet_range(sheet) {
            Ok(r) => r,
            Err(e) => {
                debug!(file = %name, sheet = %sheet, error = %e, "unreadable sheet skipped");
                continue;
            }
        };
        for (idx, row) in range.rows().enumerate() {
            let cells: Vec<String> = row
                .iter()
                .map(|c| match c {
                    Data::Empty => String::new(),
                    other => other.to_string(),
                })
                .collect();
            if cells.iter().all(|c| c.is_empty()) {
                continue;
            }
            text.push_str(&cells.join("\t"));
            text.push('\n');
            rows.push(DocumentRow {
                source: format!("xlsx:{name}:{sheet}:row{}", idx + 1),
                cells,
            });
        }
    }
    Ok(DocumentContent {
        kind,
        rows,
        text,
        sheetnames,
        looks_scanned: false,
    })
}

fn decode_pdf(path: &Path, name: &str) -> Result<DocumentContent, DocumentError> {
    let text = pdf_extract::extract_text(path).map_err(|e| DocumentError::Decode {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let looks_scanned = text.trim().len() < MIN_TEXT_LENGTH;
    Ok(DocumentContent {
        kind: DocumentKind::Pdf,
        rows: pdf_text_rows(&text, name),
        text,
        sheetnames: vec![],
        looks_scanned,
    })
}

/// Split PDF (or OCR) text into pseudo-rows for cell scanning. Lines are
/// split on colons, tabs, and pipes, mirroring how report layouts separate
/// labels from values.
pub fn pdf_text_rows(text: &str, name: &str) -> Vec<DocumentRow> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| DocumentRow {
            source: format!("pdf:{name}:line{}", idx + 1),
            cells: PDF_CELL_SPLIT_RE
                .split(line)
                .map(|c| c.trim().to_string())
                .collect(),
        })
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
