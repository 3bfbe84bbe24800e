//! Processed-message ledger — the idempotency backbone of the pipeline.
//!
//! Every message that completes a run (extracted, skipped, or quarantined)
//! is recorded under its message id. Re-running over the same mailbox window
//! then skips those ids before any decoding or LLM spend happens. Marking an
//! already-recorded id is a no-op, so crashes between "rows appended" and
//! "marked" err on the side of reprocessing rather than data loss.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::LedgerError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS processed_messages (
            message_id TEXT PRIMARY KEY,
            received_at TEXT NOT NULL,
            folder TEXT NOT NULL,
            subject TEXT NOT NULL,
            sender TEXT NOT NULL,
            run_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            rows_appended INTEGER NOT NULL DEFAULT 0,
            processed_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_processed_run ON processed_messages(run_id);
        CREATE INDEX IF NOT EXISTS idx_processed_outcome ON processed_messages(outcome);
    "#,
}];

/// What gets recorded when a message finishes processing.
#[derive(Debug, Clone)]
pub struct ProcessedMessage {
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub folder: String,
    pub subject: String,
    pub sender: String,
    pub run_id: String,
    /// Terminal outcome label, e.g. `extracted` or a skip reason label.
    pub outcome: String,
    pub rows_appended: i64,
}

/// Idempotency store for the pipeline.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// True when the message id already has a ledger entry.
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError>;

    /// Record a finished message. Recording an id that already exists is a
    /// no-op and keeps the original entry.
    async fn mark_processed(&self, entry: &ProcessedMessage) -> Result<(), LedgerError>;

    /// Total entries in the ledger.
    async fn processed_count(&self) -> Result<u64, LedgerError>;
}

/// libSQL-backed ledger.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local ledger file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Connection(format!("Failed to create ledger directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LedgerError::Connection(format!("Failed to open ledger database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| LedgerError::Connection(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory ledger (for tests).
    pub async fn new_memory() -> Result<Self, LedgerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                LedgerError::Connection(format!("Failed to create in-memory ledger: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| LedgerError::Connection(format!("Failed to create connection: {e}")))?;

        let ledger = Self {
            db: Arc::new(db),
            conn,
        };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        run_migrations(&self.conn).await
    }
}

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM processed_messages WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("is_processed: {e}")))?;
        let hit = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("is_processed: {e}")))?
            .is_some();
        Ok(hit)
    }

    async fn mark_processed(&self, entry: &ProcessedMessage) -> Result<(), LedgerError> {
        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO processed_messages
                    (message_id, received_at, folder, subject, sender, run_id, outcome, rows_appended)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.message_id.as_str(),
                    entry.received_at.to_rfc3339(),
                    entry.folder.as_str(),
                    entry.subject.as_str(),
                    entry.sender.as_str(),
                    entry.run_id.as_str(),
                    entry.outcome.as_str(),
                    entry.rows_appended,
                ],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("mark_processed: {e}")))?;
        if affected == 0 {
            debug!(message_id = %entry.message_id, "ledger entry already present, kept");
        }
        Ok(())
    }

    async fn processed_count(&self) -> Result<u64, LedgerError> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM processed_messages", ())
            .await
            .map_err(|e| LedgerError::Query(format!("processed_count: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("processed_count: {e}")))?
            .ok_or_else(|| LedgerError::Query("processed_count: empty result".to_string()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| LedgerError::Query(format!("processed_count: {e}")))?;
        Ok(count.max(0) as u64)
    }
}

/// Apply pending migrations, tracking versions in `_migrations`.
async fn run_migrations(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| LedgerError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                LedgerError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            LedgerError::Migration(format!(
                "Failed to record migration V{}: {e}",
                migration.version
            ))
        })?;
        info!(version = migration.version, name = migration.name, "Ledger migration applied");
    }
    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, LedgerError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| LedgerError::Migration(format!("Failed to read migration version: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| LedgerError::Migration(format!("Failed to read migration version: {e}")))?;
    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| LedgerError::Migration(format!("Failed to read migration version: {e}"))),
        None => Ok(0),
    }
}

/// In-memory ledger for unit tests of callers; a plain set behind a mutex.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    seen: std::sync::Mutex<std::collections::HashSet<String>>,
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn is_processed(&self, message_id: &str) -> Result<bool, LedgerError> {
        let seen = self
            .seen
            .lock()
            .map_err(|e| LedgerError::Query(format!("ledger lock poisoned: {e}")))?;
        Ok(seen.contains(message_id))
    }

    async fn mark_processed(&self, entry: &ProcessedMessage) -> Result<(), LedgerError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|e| LedgerError::Query(format!("ledger lock poisoned: {e}")))?;
        seen.insert(entry.message_id.clone());
        Ok(())
    }

    async fn processed_count(&self) -> Result<u64, LedgerError> {
        let seen = self
            .seen
            .lock()
            .map_err(|e| LedgerError::Query(format!("ledger lock poisoned: {e}")))?;
        Ok(seen.len() as u64)
    }
}
