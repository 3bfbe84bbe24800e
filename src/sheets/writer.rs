//! Batched sheet writer with rate-limit backoff.
//!
//! Rows are buffered and flushed in batches. A rate-limited batch is retried
//! with exponential backoff and jitter; when retries run out the batch is
//! split in half and each half retried independently, down to a floor, so
//! one bad window costs part of a batch rather than the whole run. Every
//! buffered row comes back in the flush result exactly once.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::error::SheetError;
use crate::pipeline::types::KpiRecord;

use super::{SheetClient, record_to_row};

/// Writer tuning. Defaults match production; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
    /// Batches at or below this size are not split further.
    pub split_floor: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            max_retries: 8,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_jitter: Duration::from_millis(250),
            split_floor: 10,
        }
    }
}

/// Terminal state of one buffered row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowStatus {
    Appended,
    Failed,
}

/// Per-row flush outcome.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RowResult {
    pub batch_index: usize,
    pub row_index: usize,
    pub entity: String,
    pub date: String,
    pub status: RowStatus,
    pub error: Option<String>,
    pub retry_count: u32,
}

struct PendingRow {
    entity: String,
    date: String,
    cells: Vec<String>,
}

/// Buffering writer over any [`SheetClient`].
pub struct BatchedSheetWriter {
    client: Arc<dyn SheetClient>,
    config: WriterConfig,
    buffer: Vec<PendingRow>,
}

impl BatchedSheetWriter {
    pub fn new(client: Arc<dyn SheetClient>) -> Self {
        Self::with_config(client, WriterConfig::default())
    }

    pub fn with_config(client: Arc<dyn SheetClient>, config: WriterConfig) -> Self {
        Self {
            client,
            config,
            buffer: Vec::new(),
        }
    }

    /// Buffer one record for the next flush.
    pub fn append(&mut self, record: &KpiRecord) {
        self.buffer.push(PendingRow {
            entity: record.entity.clone(),
            date: record
                .date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            cells: record_to_row(record),
        });
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Send everything buffered, returning one result per row.
    pub async fn flush(&mut self) -> Vec<RowResult> {
        let rows: Vec<PendingRow> = std::mem::take(&mut self.buffer);
        if rows.is_empty() {
            return Vec::new();
        }
        let total = rows.len();
        let mut results: Vec<RowResult> = Vec::with_capacity(total);

        let mut row_index = 0usize;
        for (batch_index, batch) in rows.chunks(self.config.batch_size.max(1)).enumerate() {
            self.send_batch(batch, batch_index, row_index, &mut results).await;
            row_index += batch.len();
        }

        let appended = results.iter().filter(|r| r.status == RowStatus::Appended).count();
        info!(total, appended, failed = total - appended, "sheet flush complete");
        debug_assert_eq!(results.len(), total);
        results
    }

    /// Retry a batch under backoff; split in half on exhaustion.
    fn send_batch<'a>(
        &'a self,
        batch: &'a [PendingRow],
        batch_index: usize,
        base_row_index: usize,
        results: &'a mut Vec<RowResult>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let cells: Vec<Vec<String>> = batch.iter().map(|r| r.cells.clone()).collect();
            let mut attempt = 0u32;
            loop {
                match self.client.append_rows(&cells).await {
                    Ok(()) => {
                        for (i, row) in batch.iter().enumerate() {
                            results.push(RowResult {
                                batch_index,
                                row_index: base_row_index + i,
                                entity: row.entity.clone(),
                                date: row.date.clone(),
                                status: RowStatus::Appended,
                                error: None,
                                retry_count: attempt,
                            });
                        }
                        return;
                    }
                    Err(e) if e.is_rate_limit() && attempt < self.config.max_retries => {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            batch_index,
                            rows = batch.len(),
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "rate limited, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) if e.is_rate_limit() => {
                        // Retries exhausted. Halving the batch gives each
                        // half a fresh retry budget in a later quota window.
                        if batch.len() > self.config.split_floor {
                            let mid = batch.len() / 2;
                            warn!(batch_index, rows = batch.len(), "splitting rate-limited batch");
                            self.send_batch(&batch[..mid], batch_index, base_row_index, results)
                                .await;
                            self.send_batch(&batch[mid..], batch_index, base_row_index + mid, results)
                                .await;
                        } else {
                            self.fail_batch(batch, batch_index, base_row_index, attempt, &e, results);
                        }
                        return;
                    }
                    Err(e) => {
                        self.fail_batch(batch, batch_index, base_row_index, attempt, &e, results);
                        return;
                    }
                }
            }
        })
    }

    fn fail_batch(
        &self,
        batch: &[PendingRow],
        batch_index: usize,
        base_row_index: usize,
        attempt: u32,
        error: &SheetError,
        results: &mut Vec<RowResult>,
    ) {
        warn!(batch_index, rows = batch.len(), error = %error, "batch failed");
        for (i, row) in batch.iter().enumerate() {
            results.push(RowResult {
                batch_index,
                row_index: base_row_index + i,
                entity: row.entity.clone(),
                date: row.date.clone(),
                status: RowStatus::Failed,
                error: Some(error.to_string()),
                retry_count: attempt,
            });
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.max_backoff);
        let jitter_ms = self.config.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use crate::kpi::KpiValues;
    use crate::pipeline::types::SourceType;

    use super::*;

    fn record(entity: &str) -> KpiRecord {
        KpiRecord {
            entity: entity.into(),
            date: NaiveDate::from_ymd_opt(2026, 8, 14),
            values: KpiValues {
                revenue: Some(1000.0),
                ..KpiValues::default()
            },
            alerts: String::new(),
            notes: String::new(),
            run_id: "run-1".into(),
            message_id: "m1".into(),
            sender: "reports@acme.com".into(),
            subject: "daily".into(),
            candidate_score: 5,
            candidate_reasons: vec![],
            source_type: SourceType::Body,
            attachment_name: String::new(),
            evidence: vec![],
            confidence: 0.5,
            validation_flags: String::new(),
            source_rule_id: String::new(),
            source_match_score: 0.0,
            source_report_type: String::new(),
            source_parse_confidence: 0.0,
        }
    }

    fn fast_config(batch_size: usize, max_retries: u32, split_floor: usize) -> WriterConfig {
        WriterConfig {
            batch_size,
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_jitter: Duration::ZERO,
            split_floor,
        }
    }

    /// Scripted client: rate-limits the first `limit_calls` appends, then
    /// accepts. Records every call's row count.
    struct FlakyClient {
        limit_calls: usize,
        calls: Mutex<Vec<usize>>,
    }

    impl FlakyClient {
        fn new(limit_calls: usize) -> Self {
            Self {
                limit_calls,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SheetClient for FlakyClient {
        async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError> {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.len();
            calls.push(rows.len());
            if n < self.limit_calls {
                Err(SheetError::RateLimited)
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn clean_flush_appends_everything() {
        let client = Arc::new(FlakyClient::new(0));
        let mut writer = BatchedSheetWriter::with_config(client.clone(), fast_config(10, 3, 2));
        for i in 0..25 {
            writer.append(&record(&format!("e{i}")));
        }
        let results = writer.flush().await;
        assert_eq!(results.len(), 25);
        assert!(results.iter().all(|r| r.status == RowStatus::Appended));
        // 25 rows at batch size 10 means three calls
        assert_eq!(*client.calls.lock().unwrap(), vec![10, 10, 5]);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test]
    async fn transient_rate_limit_retried_to_success() {
        let client = Arc::new(FlakyClient::new(2));
        let mut writer = BatchedSheetWriter::with_config(client, fast_config(10, 5, 2));
        writer.append(&record("a"));
        let results = writer.flush().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RowStatus::Appended);
        assert_eq!(results[0].retry_count, 2);
    }

    #[tokio::test]
    async fn persistent_rate_limit_splits_then_fails_all_rows() {
        let client = Arc::new(FlakyClient::new(usize::MAX));
        let mut writer = BatchedSheetWriter::with_config(client.clone(), fast_config(20, 1, 5));
        for i in 0..20 {
            writer.append(&record(&format!("e{i}")));
        }
        let results = writer.flush().await;
        // Row conservation: every row reported exactly once, all failed.
        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| r.status == RowStatus::Failed));
        let mut indices: Vec<usize> = results.iter().map(|r| r.row_index).collect();
        indices.sort();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());
        // 20 split to 10+10, then each to 5+5 at the floor
        let calls = client.calls.lock().unwrap();
        assert!(calls.iter().filter(|&&n| n == 5).count() >= 4);
    }

    #[tokio::test]
    async fn auth_failure_not_retried() {
        struct AuthFail;
        #[async_trait]
        impl SheetClient for AuthFail {
            async fn append_rows(&self, _rows: &[Vec<String>]) -> Result<(), SheetError> {
                Err(SheetError::AuthFailed("HTTP 403".into()))
            }
        }
        let mut writer =
            BatchedSheetWriter::with_config(Arc::new(AuthFail), fast_config(10, 5, 2));
        writer.append(&record("a"));
        let results = writer.flush().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, RowStatus::Failed);
        assert_eq!(results[0].retry_count, 0);
        assert!(results[0].error.as_deref().unwrap().contains("403"));
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let client = Arc::new(FlakyClient::new(0));
        let mut writer = BatchedSheetWriter::new(client.clone());
        assert!(writer.flush().await.is_empty());
        assert!(client.calls.lock().unwrap().is_empty());
    }
}
