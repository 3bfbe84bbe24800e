//! Attachment type gate — deterministic pre-filter for the ingestion pipeline.
//!
//! Keeps image-only emails and signature noise from consuming suitability
//! scoring or LLM extraction time. Runs before source matching and
//! extraction; pure function, no side effects. The gate never makes a final
//! accept/reject call on KPI content, it only triages the attachment set.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::AttachmentMeta;

/// Extensions that can be parsed for KPIs.
pub const KPI_PARSEABLE_EXTENSIONS: [&str; 4] = [".pdf", ".xlsx", ".xls", ".csv"];

/// Image extensions (signature / inline noise).
pub const IMAGE_EXTENSIONS: [&str; 7] =
    [".png", ".jpg", ".jpeg", ".gif", ".bmp", ".tif", ".tiff"];

// image001.png, Outlook signature fragments, _001.pdf forward artefacts,
// CID-referenced inline images.
static NOISE_FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^image\d{3}\.|^outlook-|^_\d{3}\.\w+$|^cid:").expect("static regex")
});

// Subjects that indicate an inline-image forward.
static NOISE_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)attached image|fwd:\s*image|fw:\s*image|^image\s*$").expect("static regex")
});

/// Gate outcome for one message's attachment set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    /// At least one KPI-parseable attachment, or harmless non-image files.
    Pass,
    /// Every attachment is an image.
    NoiseImageOnly,
    /// Only noise-pattern filenames (image001.pdf and friends).
    NoiseSignature,
    /// Subject indicates an inline-image forward and nothing parseable exists.
    NoiseSubject,
    /// Email has no attachments at all (body-only candidate).
    NoAttachments,
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Pass => "PASS",
            GateDecision::NoiseImageOnly => "NOISE_IMAGE_ONLY",
            GateDecision::NoiseSignature => "NOISE_SIGNATURE",
            GateDecision::NoiseSubject => "NOISE_SUBJECT",
            GateDecision::NoAttachments => "NO_ATTACHMENTS",
        }
    }

    /// Noise decisions skip attachment extraction; `Pass` and
    /// `NoAttachments` continue through the pipeline.
    pub fn is_noise(&self) -> bool {
        matches!(
            self,
            GateDecision::NoiseImageOnly
                | GateDecision::NoiseSignature
                | GateDecision::NoiseSubject
        )
    }
}

/// Full gate result, kept for the run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub decision: GateDecision,
    pub reason: String,
    /// Parseable extensions found (empty for noise decisions).
    pub kpi_attachment_exts: Vec<String>,
    pub image_count: usize,
    pub total_count: usize,
}

/// Evaluate the attachment gate for one message's attachments and subject.
pub fn evaluate(attachments: &[AttachmentMeta], subject: &str) -> GateResult {
    let total_count = attachments.len();

    if total_count == 0 {
        return GateResult {
            decision: GateDecision::NoAttachments,
            reason: "email has no attachments".into(),
            kpi_attachment_exts: vec![],
            image_count: 0,
            total_count: 0,
        };
    }

    let mut kpi_exts: Vec<String> = Vec::new();
    let mut image_count = 0usize;
    let mut noise_filename_count = 0usize;

    for att in attachments {
        if IMAGE_EXTENSIONS.contains(&att.ext.as_str()) {
            image_count += 1;
        }
        if KPI_PARSEABLE_EXTENSIONS.contains(&att.ext.as_str()) {
            if NOISE_FILENAME_RE.is_match(&att.name) {
                noise_filename_count += 1;
            } else {
                kpi_exts.push(att.ext.clone());
            }
        }
    }

    // Image-only sets outrank the subject heuristic: an inline-image
    // forward with nothing but images is NOISE_IMAGE_ONLY, not
    // NOISE_SUBJECT.
    if image_count == total_count {
        let exts: Vec<&str> = attachments.iter().map(|a| a.ext.as_str()).collect();
        return GateResult {
            decision: GateDecision::NoiseImageOnly,
            reason: format!(
                "all {total_count} attachment(s) are images ({})",
                exts.join(", ")
            ),
            kpi_attachment_exts: vec![],
            image_count,
            total_count,
        };
    }

    if NOISE_SUBJECT_RE.is_match(subject) && kpi_exts.is_empty() {
        let snippet: String = subject.chars().take(60).collect();
        return GateResult {
            decision: GateDecision::NoiseSubject,
            reason: format!(
                "subject indicates image forward ('{snippet}') and no KPI-parseable attachments"
            ),
            kpi_attachment_exts: vec![],
            image_count,
            total_count,
        };
    }

    if kpi_exts.is_empty() && noise_filename_count > 0 {
        return GateResult {
            decision: GateDecision::NoiseSignature,
            reason: format!(
                "only noise-pattern attachments found ({noise_filename_count} noise, {image_count} images)"
            ),
            kpi_attachment_exts: vec![],
            image_count,
            total_count,
        };
    }

    if !kpi_exts.is_empty() {
        let joined = kpi_exts.join(", ");
        return GateResult {
            decision: GateDecision::Pass,
            reason: format!("has {} KPI-parseable attachment(s): {joined}", kpi_exts.len()),
            kpi_attachment_exts: kpi_exts,
            image_count,
            total_count,
        };
    }

    // Non-image, non-KPI attachments (.docx, .txt, ...). Let these through
    // for body-text extraction but flag as no KPI attachment.
    let other_exts: Vec<&str> = attachments
        .iter()
        .filter(|a| !IMAGE_EXTENSIONS.contains(&a.ext.as_str()))
        .map(|a| a.ext.as_str())
        .collect();
    if other_exts.is_empty() {
        return GateResult {
            decision: GateDecision::NoiseImageOnly,
            reason: "all attachments are images or empty".into(),
            kpi_attachment_exts: vec![],
            image_count,
            total_count,
        };
    }
    GateResult {
        decision: GateDecision::Pass,
        reason: format!(
            "non-image attachments present ({}), allowing body extraction",
            other_exts.join(", ")
        ),
        kpi_attachment_exts: vec![],
        image_count,
        total_count,
    }
}
