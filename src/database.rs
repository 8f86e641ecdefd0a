/// Database pool and schema management
///
/// One SQLite database holds the three engine tables:
/// - workflows: one row per business process instance
/// - workflow_steps: the step history (execution DAG) of every workflow
/// - cron_processes: one lock row per lane with heartbeat and sequence counters

use crate::{
    config::DatabaseConfig,
    error::{EngineError, Result},
};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::{str::FromStr, time::Duration};

/// Open the configured database, creating the file and schema if missing
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // Ensure the parent directory of a file database exists
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::Configuration(format!(
                    "Failed to create database directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    tracing::info!("🗄️ Opening engine database: {}", config.url);
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with the schema applied
///
/// Every pooled connection to `sqlite::memory:` would see its own database,
/// so the pool is capped at one connection that is never recycled.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create the engine tables and indexes
///
/// Safe to call multiple times (uses IF NOT EXISTS).
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            client_id INTEGER,
            request_params TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_steps (
            id TEXT PRIMARY KEY,
            workflow_id TEXT NOT NULL REFERENCES workflows(id),
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            parent_step_id TEXT,
            request_params TEXT NOT NULL,
            response_data TEXT,
            sequence_number INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cron_processes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            lane_key TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL,
            owner TEXT,
            params TEXT NOT NULL,
            sequence_number INTEGER NOT NULL,
            issued_sequence INTEGER NOT NULL,
            last_heartbeat_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflow_steps_workflow ON workflow_steps(workflow_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_workflow_steps_parent ON workflow_steps(parent_step_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_workflow_steps_status ON workflow_steps(status, updated_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Fixed-width RFC 3339 text so that SQL string comparison orders by time
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| EngineError::CorruptRecord(format!("timestamp '{}': {}", raw, e)))
}
