use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kpi_scraper::config::{KeywordConfig, PipelineOptions, RuleSet};
use kpi_scraper::context::PipelineContext;
use kpi_scraper::docs::ocr::{OcrEngine, TesseractOcr};
use kpi_scraper::entity::EntityAliases;
use kpi_scraper::ledger::LibSqlLedger;
use kpi_scraper::llm::{KpiLlm, LlmConfig, create_extractor};
use kpi_scraper::mailstore::EmlMailStore;
use kpi_scraper::pipeline::Pipeline;
use kpi_scraper::sheets::writer::{BatchedSheetWriter, WriterConfig};
use kpi_scraper::sheets::{CsvSheetClient, GoogleSheetsClient, SheetClient};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).unwrap_or_else(|_| default.to_string()).into()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_dir = env_path("KPI_LOG_DIR", "./logs");
    let file_appender = tracing_appender::rolling::daily(&log_dir, "kpi-scraper.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let mail_dir = env_path("KPI_MAIL_DIR", "./mail");
    let data_dir = env_path("KPI_DATA_DIR", "./data");
    let config_dir = env_path("KPI_CONFIG_DIR", "./config");

    let options = PipelineOptions::from_env()?;
    let rules = RuleSet::load(&config_dir.join("source_rules.json"))?;
    let keywords = KeywordConfig::load_dir(&config_dir);
    keywords.log_summary();
    let entities = EntityAliases::load(&config_dir.join("entity_aliases.json"))?;

    let ledger = Arc::new(LibSqlLedger::new_local(&data_dir.join("ledger.db")).await?);

    eprintln!("kpi-scraper v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mail: {}", mail_dir.display());
    eprintln!("   Data: {}", data_dir.display());
    eprintln!("   Window: {} days back", options.days_back);

    let llm: Option<Arc<dyn KpiLlm>> = if options.llm_enabled {
        match LlmConfig::from_env() {
            Some(llm_config) => {
                let extractor = create_extractor(&llm_config)?;
                eprintln!("   LLM: {}", extractor.model_name());
                Some(extractor)
            }
            None => {
                eprintln!("   LLM: disabled (no API key)");
                None
            }
        }
    } else {
        None
    };

    let ocr: Option<Arc<dyn OcrEngine>> = if options.ocr_enabled {
        let engine = TesseractOcr::new();
        if engine.is_available().await {
            eprintln!("   OCR: tesseract + pdftoppm");
            Some(Arc::new(engine))
        } else {
            eprintln!("   OCR: disabled (binaries missing)");
            None
        }
    } else {
        None
    };

    let client: Arc<dyn SheetClient> = match (
        std::env::var("KPI_SHEET_ID"),
        std::env::var("KPI_SHEET_TOKEN"),
    ) {
        (Ok(sheet_id), Ok(token)) => {
            let range = std::env::var("KPI_SHEET_RANGE").unwrap_or_else(|_| "KPI!A:Z".to_string());
            eprintln!("   Sheet: {sheet_id} ({range})");
            Arc::new(GoogleSheetsClient::new(
                sheet_id,
                range,
                secrecy::SecretString::from(token),
            ))
        }
        _ => {
            let csv_path = data_dir.join("kpi_rows.csv");
            eprintln!("   Sheet: CSV fallback at {}", csv_path.display());
            Arc::new(CsvSheetClient::new(csv_path))
        }
    };
    let writer_config = WriterConfig {
        batch_size: options.batch_size,
        ..WriterConfig::default()
    };

    let store = EmlMailStore::new(&mail_dir, data_dir.join("attachments"));
    let watch_minutes: Option<u64> = std::env::var("KPI_WATCH_MINUTES")
        .ok()
        .and_then(|v| v.parse().ok());

    loop {
        let mut ctx = PipelineContext::new(
            rules.clone(),
            keywords.clone(),
            options.clone(),
            ledger.clone(),
        )
        .with_entities(entities.clone());
        if let Some(llm) = llm.clone() {
            ctx = ctx.with_llm(llm);
        }
        if let Some(ocr) = ocr.clone() {
            ctx = ctx.with_ocr(ocr);
        }

        let mut writer = BatchedSheetWriter::with_config(client.clone(), writer_config.clone());
        let report = Pipeline::new(ctx).run(&store, &mut writer).await?;
        report.write_artifacts(&log_dir)?;

        match watch_minutes {
            Some(minutes) => {
                info!(minutes, "watch mode, sleeping until next run");
                tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
            }
            None => {
                if report.rows_failed > 0 {
                    eprintln!(
                        "Run finished with {} row(s) failed to append; they will be retried next run.",
                        report.rows_failed
                    );
                    std::process::exit(1);
                }
                return Ok(());
            }
        }
    }
}
