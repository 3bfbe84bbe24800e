//! Error types for the KPI scraper.

use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mail store error: {0}")]
    Mail(#[from] MailError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Sheet error: {0}")]
    Sheet(#[from] SheetError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported rule schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mail-store errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail directory not found: {0}")]
    DirNotFound(String),

    #[error("Failed to parse message {name}: {reason}")]
    Parse { name: String, reason: String },

    #[error("Failed to materialize attachment {name}: {reason}")]
    Attachment { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ledger (idempotency store) errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Document decoding / OCR errors.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to decode {name}: {reason}")]
    Decode { name: String, reason: String },

    #[error("Text extraction timed out after {timeout:?} for {name}")]
    Timeout { name: String, timeout: Duration },

    #[error("OCR unavailable: {0}")]
    OcrUnavailable(String),

    #[error("OCR failed for {name}: {reason}")]
    Ocr { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Spreadsheet append errors.
///
/// `RateLimited` is the only retryable variant — everything else is terminal
/// for the batch that triggered it.
#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    #[error("Rate limited by sheet API")]
    RateLimited,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Append request failed: {0}")]
    RequestFailed(String),

    #[error("Malformed response: {0}")]
    InvalidResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SheetError {
    /// Whether the writer should retry this failure with backoff.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SheetError::RateLimited)
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
