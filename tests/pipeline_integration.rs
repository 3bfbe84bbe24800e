//! End-to-end runs over an `.eml` directory: extraction, noise gating,
//! idempotent re-runs, and rate-limit handling at the sheet edge.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use kpi_scraper::config::{KeywordConfig, PipelineOptions, RuleSet, SourceRuleFile};
use kpi_scraper::context::PipelineContext;
use kpi_scraper::error::SheetError;
use kpi_scraper::ledger::{Ledger, LibSqlLedger};
use kpi_scraper::mailstore::EmlMailStore;
use kpi_scraper::pipeline::Pipeline;
use kpi_scraper::sheets::SheetClient;
use kpi_scraper::sheets::writer::{BatchedSheetWriter, WriterConfig};

const RULES: &str = r#"{
    "schema_version": 1,
    "defaults": { "unknown_source_policy": "quarantine", "global_reject_threshold": 0.45 },
    "sources": [{
        "id": "acme_daily",
        "entity": "Acme",
        "report_type": "daily_flash",
        "priority": 10,
        "match": {
            "from_addresses": ["reports@acme.com"],
            "from_domains": ["acme.com"],
            "subject_regex": "daily\\s+(kpi|snapshot)",
            "body_contains": []
        },
        "expected_kpis": [
            { "kpi_key": "revenue", "required": true },
            { "kpi_key": "cash", "required": false }
        ]
    }]
}"#;

const CSV_BODY: &str = "Daily Snapshot,Month to Date\r\nRevenue,\"$125,000\"\r\nCash,\"$300,000\"\r\nTotal Occupancy,92%\r\n";

struct CollectingClient {
    rows: Mutex<Vec<Vec<String>>>,
}

impl CollectingClient {
    fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SheetClient for CollectingClient {
    async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), SheetError> {
        self.rows.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }
}

struct RateLimitedClient;

#[async_trait]
impl SheetClient for RateLimitedClient {
    async fn append_rows(&self, _rows: &[Vec<String>]) -> Result<(), SheetError> {
        Err(SheetError::RateLimited)
    }
}

fn recent_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S +0000").to_string()
}

fn plain_eml(id: &str, from: &str, subject: &str, body: &str) -> String {
    format!(
        "From: Reports <{from}>\r\nTo: me@corp.com\r\nSubject: {subject}\r\nDate: {}\r\nMessage-ID: <{id}@test>\r\nContent-Type: text/plain\r\n\r\n{body}\r\n",
        recent_date()
    )
}

fn eml_with_attachment(
    id: &str,
    from: &str,
    subject: &str,
    att_name: &str,
    content_type: &str,
    att_body: &str,
) -> String {
    format!(
        "From: Reports <{from}>\r\nTo: me@corp.com\r\nSubject: {subject}\r\nDate: {}\r\nMessage-ID: <{id}@test>\r\nMIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"b\"\r\n\r\n--b\r\nContent-Type: text/plain\r\n\r\nsee attached\r\n--b\r\nContent-Type: {content_type}; name=\"{att_name}\"\r\nContent-Disposition: attachment; filename=\"{att_name}\"\r\n\r\n{att_body}\r\n--b--\r\n",
        recent_date()
    )
}

fn write_mailbox(dir: &std::path::Path) {
    std::fs::write(
        dir.join("m1.eml"),
        eml_with_attachment(
            "m1",
            "reports@acme.com",
            "Daily KPI Snapshot",
            "daily_report.csv",
            "text/csv",
            CSV_BODY,
        ),
    )
    .expect("write m1");
    std::fs::write(
        dir.join("m2.eml"),
        eml_with_attachment(
            "m2",
            "reports@acme.com",
            "FW: image001.jpg",
            "image001.jpg",
            "image/jpeg",
            "notanimage",
        ),
    )
    .expect("write m2");
    std::fs::write(
        dir.join("m3.eml"),
        eml_with_attachment(
            "m3",
            "stranger@unknown.io",
            "Weekly numbers",
            "numbers.csv",
            "text/csv",
            "a,b\r\n1,2\r\n",
        ),
    )
    .expect("write m3");
}

async fn context_with_rules(rules_json: &str, ledger: Arc<LibSqlLedger>) -> PipelineContext {
    let file: SourceRuleFile = serde_json::from_str(rules_json).expect("rules");
    let rules = RuleSet::from_file(file);
    let mut keywords = KeywordConfig::default();
    keywords.trusted_senders.insert("reports@acme.com".into());
    keywords.trusted_domains.insert("acme.com".into());
    PipelineContext::new(rules, keywords, PipelineOptions::default(), ledger)
}

async fn context(ledger: Arc<LibSqlLedger>) -> PipelineContext {
    context_with_rules(RULES, ledger).await
}

fn fast_writer(client: Arc<dyn SheetClient>) -> BatchedSheetWriter {
    BatchedSheetWriter::with_config(
        client,
        WriterConfig {
            batch_size: 200,
            max_retries: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            max_jitter: Duration::ZERO,
            split_floor: 10,
        },
    )
}

#[tokio::test]
async fn full_run_extracts_gates_and_quarantines() {
    let mail = tempfile::tempdir().expect("tempdir");
    let scratch = tempfile::tempdir().expect("tempdir");
    write_mailbox(mail.path());

    let ledger = Arc::new(LibSqlLedger::new_memory().await.expect("ledger"));
    let ctx = context(ledger.clone()).await;
    let client = Arc::new(CollectingClient::new());
    let mut writer = fast_writer(client.clone());
    let store = EmlMailStore::new(mail.path(), scratch.path());

    let report = Pipeline::new(ctx)
        .run(&store, &mut writer)
        .await
        .expect("run");

    assert_eq!(report.scanned, 3);
    assert_eq!(report.extracted, 1);
    assert_eq!(report.rows_appended, 1);
    assert_eq!(report.rows_failed, 0);
    assert_eq!(report.skips.get("attachment_noise"), Some(&1));
    assert_eq!(report.skips.get("quarantined"), Some(&1));
    assert_eq!(report.quarantine.len(), 1);
    assert_eq!(report.quarantine[0].sender, "stranger@unknown.io");

    // The image-forward message is gated as image-only noise specifically.
    let noise = report
        .trace
        .iter()
        .find(|t| t.outcome == "attachment_noise")
        .expect("noise trace entry");
    assert!(noise.detail.starts_with("NOISE_IMAGE_ONLY"));

    let rows = client.rows.lock().unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row[1], "Acme"); // entity
    assert_eq!(row[2], "125000"); // revenue
    assert_eq!(row[3], "300000"); // cash
    assert_eq!(row[7], "0.92"); // occupancy
    assert_eq!(row[16], "attachment"); // source_type
    assert_eq!(row[18], "attachment: daily_report.csv"); // evidence snippet
    assert!(row[20].parse::<f64>().expect("confidence") > 0.0);

    // Extracted and noise messages are committed; quarantined mail stays
    // out of the ledger so a later rule can still claim it.
    assert_eq!(ledger.processed_count().await.expect("count"), 2);
    assert!(ledger.is_processed("m1@test").await.expect("check"));
    assert!(!ledger.is_processed("m3@test").await.expect("check"));
}

#[tokio::test]
async fn second_run_appends_nothing() {
    let mail = tempfile::tempdir().expect("tempdir");
    let scratch = tempfile::tempdir().expect("tempdir");
    write_mailbox(mail.path());

    let ledger = Arc::new(LibSqlLedger::new_memory().await.expect("ledger"));
    let client = Arc::new(CollectingClient::new());
    let store = EmlMailStore::new(mail.path(), scratch.path());

    let mut writer = fast_writer(client.clone());
    Pipeline::new(context(ledger.clone()).await)
        .run(&store, &mut writer)
        .await
        .expect("first run");

    let mut writer = fast_writer(client.clone());
    let report = Pipeline::new(context(ledger.clone()).await)
        .run(&store, &mut writer)
        .await
        .expect("second run");

    assert_eq!(report.extracted, 0);
    assert_eq!(report.rows_appended, 0);
    assert_eq!(report.skips.get("already_processed"), Some(&2));
    // The quarantined message is re-examined every run until a rule claims it.
    assert_eq!(report.skips.get("quarantined"), Some(&1));
    // No duplicate rows reached the sheet.
    assert_eq!(client.rows.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn quarantined_message_recovered_by_later_rule() {
    let mail = tempfile::tempdir().expect("tempdir");
    let scratch = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        mail.path().join("m9.eml"),
        eml_with_attachment(
            "m9",
            "reports@newco.io",
            "Daily KPI Snapshot",
            "daily_report.csv",
            "text/csv",
            CSV_BODY,
        ),
    )
    .expect("write m9");

    let ledger = Arc::new(LibSqlLedger::new_memory().await.expect("ledger"));
    let store = EmlMailStore::new(mail.path(), scratch.path());
    let client = Arc::new(CollectingClient::new());

    // No rule for newco.io yet: quarantined, and NOT committed.
    let mut writer = fast_writer(client.clone());
    let report = Pipeline::new(context(ledger.clone()).await)
        .run(&store, &mut writer)
        .await
        .expect("first run");
    assert_eq!(report.quarantine.len(), 1);
    assert!(!ledger.is_processed("m9@test").await.expect("check"));

    // Operator writes the rule; the next run extracts the held message.
    let newco_rules = RULES.replace("acme_daily", "newco_daily").replace("acme.com", "newco.io");
    let mut writer = fast_writer(client.clone());
    let report = Pipeline::new(context_with_rules(&newco_rules, ledger.clone()).await)
        .run(&store, &mut writer)
        .await
        .expect("second run");
    assert_eq!(report.extracted, 1);
    assert_eq!(report.rows_appended, 1);
    assert!(ledger.is_processed("m9@test").await.expect("check"));
}

#[tokio::test]
async fn rate_limited_rows_stay_unmarked_and_retry() {
    let mail = tempfile::tempdir().expect("tempdir");
    let scratch = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        mail.path().join("m1.eml"),
        eml_with_attachment(
            "m1",
            "reports@acme.com",
            "Daily KPI Snapshot",
            "daily_report.csv",
            "text/csv",
            CSV_BODY,
        ),
    )
    .expect("write m1");

    let ledger = Arc::new(LibSqlLedger::new_memory().await.expect("ledger"));
    let store = EmlMailStore::new(mail.path(), scratch.path());

    let mut writer = fast_writer(Arc::new(RateLimitedClient));
    let report = Pipeline::new(context(ledger.clone()).await)
        .run(&store, &mut writer)
        .await
        .expect("run");

    // The row failed to append, so the message is not committed.
    assert_eq!(report.extracted, 1);
    assert_eq!(report.rows_appended, 0);
    assert_eq!(report.rows_failed, 1);
    assert!(!ledger.is_processed("m1@test").await.expect("check"));

    // Next run with a healthy sheet picks it up again.
    let client = Arc::new(CollectingClient::new());
    let mut writer = fast_writer(client.clone());
    let report = Pipeline::new(context(ledger.clone()).await)
        .run(&store, &mut writer)
        .await
        .expect("retry run");
    assert_eq!(report.rows_appended, 1);
    assert_eq!(client.rows.lock().unwrap().len(), 1);
    assert!(ledger.is_processed("m1@test").await.expect("check"));
}
