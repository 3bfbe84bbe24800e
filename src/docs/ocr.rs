//! OCR escalation for scanned PDFs.
//!
//! Shells out to `pdftoppm` (poppler) to rasterise the first pages, then
//! `tesseract` per page. Both binaries are optional; when either is missing
//! the engine reports unavailable and Tier-3 documents fall through to
//! Tier 4 instead of crashing the run.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DocumentError;

/// Pages OCRed per document. Reports put their headline numbers up front;
/// later pages are detail that regex scanning does not need.
pub const DEFAULT_MAX_PAGES: u32 = 3;
const DEFAULT_DPI: u32 = 250;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Text recovery from scanned documents.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// True when the engine's dependencies are present.
    async fn is_available(&self) -> bool;

    /// OCR the first `max_pages` of `path`, returning recovered text
    /// (possibly empty).
    async fn ocr_pdf(&self, path: &Path, max_pages: u32) -> Result<String, DocumentError>;
}

/// Tesseract-backed engine using poppler for rasterisation.
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    pdftoppm_bin: String,
    tesseract_bin: String,
    dpi: u32,
    timeout: Duration,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            pdftoppm_bin: "pdftoppm".to_string(),
            tesseract_bin: "tesseract".to_string(),
            dpi: DEFAULT_DPI,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl TesseractOcr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binaries(mut self, pdftoppm: impl Into<String>, tesseract: impl Into<String>) -> Self {
        self.pdftoppm_bin = pdftoppm.into();
        self.tesseract_bin = tesseract.into();
        self
    }

    async fn probe(&self, bin: &str, arg: &str) -> bool {
        Command::new(bin)
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn is_available(&self) -> bool {
        let tesseract = self.probe(&self.tesseract_bin, "--version").await;
        let pdftoppm = self.probe(&self.pdftoppm_bin, "-v").await;
        if !tesseract {
            warn!("tesseract binary not found, OCR disabled");
        }
        if !pdftoppm {
            warn!("pdftoppm binary not found, OCR disabled");
        }
        tesseract && pdftoppm
    }

    async fn ocr_pdf(&self, path: &Path, max_pages: u32) -> Result<String, DocumentError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let work_dir = std::env::temp_dir().join(format!("kpi-ocr-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir).await?;
        let result = self.ocr_in_dir(path, &name, &work_dir, max_pages).await;
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            debug!(dir = %work_dir.display(), error = %e, "OCR scratch dir cleanup failed");
        }
        result
    }
}

impl TesseractOcr {
    async fn ocr_in_dir(
        &self,
        pdf: &Path,
        name: &str,
        work_dir: &Path,
        max_pages: u32,
    ) -> Result<String, DocumentError> {
        let prefix = work_dir.join("page");
        let rasterise = Command::new(&self.pdftoppm_bin)
            .arg("-png")
            .args(["-r", &self.dpi.to_string()])
            .args(["-f", "1"])
            .args(["-l", &max_pages.to_string()])
            .arg(pdf)
            .arg(&prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        let output = tokio::time::timeout(self.timeout, rasterise)
            .await
            .map_err(|_| DocumentError::Timeout {
                name: name.to_string(),
                timeout: self.timeout,
            })?
            .map_err(|e| DocumentError::OcrUnavailable(format!("{}: {e}", self.pdftoppm_bin)))?;
        if !output.status.success() {
            return Err(DocumentError::Ocr {
                name: name.to_string(),
                reason: format!(
                    "pdftoppm failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let mut pages: Vec<_> = std::fs::read_dir(work_dir)
            .map_err(DocumentError::Io)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
            .collect();
        pages.sort();

        let mut parts: Vec<String> = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let recognise = Command::new(&self.tesseract_bin)
                .arg(page)
                .arg("stdout")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output();
            let out = tokio::time::timeout(self.timeout, recognise)
                .await
                .map_err(|_| DocumentError::Timeout {
                    name: name.to_string(),
                    timeout: self.timeout,
                })?
                .map_err(|e| DocumentError::OcrUnavailable(format!("{}: {e}", self.tesseract_bin)))?;
            if !out.status.success() {
                warn!(file = %name, page = i + 1, "tesseract failed on page");
                continue;
            }
            let text = String::from_utf8_lossy(&out.stdout).into_owned();
            debug!(file = %name, page = i + 1, chars = text.len(), "OCR page done");
            parts.push(text);
        }
        Ok(parts.join("\n"))
    }
}

/// Fixed-output engine for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticOcr {
    pub text: String,
}

#[async_trait]
impl OcrEngine for StaticOcr {
    async fn is_available(&self) -> bool {
        true
    }

    async fn ocr_pdf(&self, _path: &Path, _max_pages: u32) -> Result<String, DocumentError> {
        Ok(self.text.clone())
    }
}
