/// Persistence for the `cron_processes` lock rows
///
/// Every mutation that decides lane ownership or ordering is a single
/// conditional UPDATE, so two workers can never both observe success.

use crate::{
    database::{parse_timestamp, timestamp},
    error::{EngineError, Result},
    lane::types::{CronProcess, LaneKey, LaneStatus},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row, SqliteConnection,
};

const SELECT_COLUMNS: &str = "SELECT id, kind, lane_key, status, owner, params, sequence_number, \
     issued_sequence, last_heartbeat_at, created_at, updated_at FROM cron_processes";

/// SQLite-backed lock row storage
#[derive(Debug, Clone)]
pub struct CronProcessStorage {
    pool: SqlitePool,
}

impl CronProcessStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a stopped lock row for a new lane
    pub async fn register(
        &self,
        lane_key: &LaneKey,
        params: &Value,
        initial_sequence: i64,
    ) -> Result<CronProcess> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO cron_processes
                (kind, lane_key, status, owner, params, sequence_number, issued_sequence,
                 last_heartbeat_at, created_at, updated_at)
            VALUES (?, ?, ?, NULL, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(lane_key) DO NOTHING
            "#,
        )
        .bind(&lane_key.process)
        .bind(lane_key.to_string())
        .bind(LaneStatus::Stopped.as_str())
        .bind(serde_json::to_string(params)?)
        .bind(initial_sequence)
        .bind(initial_sequence)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::Configuration(format!(
                "Lane already registered: {}",
                lane_key
            )));
        }

        self.get(lane_key)
            .await?
            .ok_or_else(|| EngineError::LaneNotFound(lane_key.to_string()))
    }

    pub async fn get(&self, lane_key: &LaneKey) -> Result<Option<CronProcess>> {
        let row = sqlx::query(&format!("{} WHERE lane_key = ?", SELECT_COLUMNS))
            .bind(lane_key.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(cron_process_from_row).transpose()
    }

    pub async fn list(&self) -> Result<Vec<CronProcess>> {
        let rows = sqlx::query(&format!("{} ORDER BY lane_key", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(cron_process_from_row).collect()
    }

    /// stopped → running under `owner`; false when the row is already running
    pub async fn try_mark_running(&self, lane_key: &LaneKey, owner: &str) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE cron_processes
            SET status = 'running', owner = ?, last_heartbeat_at = ?, updated_at = ?
            WHERE lane_key = ? AND status = 'stopped'
            "#,
        )
        .bind(owner)
        .bind(&now)
        .bind(&now)
        .bind(lane_key.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Refresh the heartbeat; false when the row is no longer ours
    pub async fn heartbeat(&self, lane_key: &LaneKey, owner: &str) -> Result<bool> {
        let now = timestamp(Utc::now());
        let result = sqlx::query(
            r#"
            UPDATE cron_processes
            SET last_heartbeat_at = ?
            WHERE lane_key = ? AND status = 'running' AND owner = ?
            "#,
        )
        .bind(&now)
        .bind(lane_key.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// running → stopped, only for the holder
    pub async fn mark_stopped(&self, lane_key: &LaneKey, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cron_processes
            SET status = 'stopped', owner = NULL, updated_at = ?
            WHERE lane_key = ? AND status = 'running' AND owner = ?
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(lane_key.to_string())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// running → stopped regardless of holder (operator path)
    pub async fn force_stop(&self, lane_key: &LaneKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cron_processes
            SET status = 'stopped', owner = NULL, updated_at = ?
            WHERE lane_key = ? AND status = 'running'
            "#,
        )
        .bind(timestamp(Utc::now()))
        .bind(lane_key.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Compare-and-set of the accepted sequence: succeeds only for `current + 1`
    pub async fn advance_sequence(&self, lane_key: &LaneKey, candidate: i64) -> Result<bool> {
        let Some(previous) = candidate.checked_sub(1) else {
            return Ok(false);
        };

        let result = sqlx::query(
            r#"
            UPDATE cron_processes
            SET sequence_number = ?, updated_at = ?
            WHERE lane_key = ? AND sequence_number = ?
            "#,
        )
        .bind(candidate)
        .bind(timestamp(Utc::now()))
        .bind(lane_key.to_string())
        .bind(previous)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn current_sequence(&self, lane_key: &LaneKey) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT sequence_number FROM cron_processes WHERE lane_key = ?")
            .bind(lane_key.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("sequence_number")))
    }

    /// Running rows whose last heartbeat is at or before `cutoff`
    pub async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<CronProcess>> {
        let rows = sqlx::query(&format!(
            "{} WHERE status = 'running' AND (last_heartbeat_at IS NULL OR last_heartbeat_at <= ?) ORDER BY lane_key",
            SELECT_COLUMNS
        ))
        .bind(timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(cron_process_from_row).collect()
    }

    /// Stamp the next dispatch sequence for a lane inside the caller's transaction.
    ///
    /// Returns None when the lane is not registered; such work is dispatched unsequenced.
    pub async fn issue_sequence(
        conn: &mut SqliteConnection,
        lane_key: &LaneKey,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            UPDATE cron_processes
            SET issued_sequence = issued_sequence + 1
            WHERE lane_key = ?
            RETURNING issued_sequence
            "#,
        )
        .bind(lane_key.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|row| row.get("issued_sequence")))
    }
}

fn cron_process_from_row(row: &SqliteRow) -> Result<CronProcess> {
    let lane_key: String = row.get("lane_key");
    let status: String = row.get("status");
    let params: String = row.get("params");
    let last_heartbeat_at: Option<String> = row.get("last_heartbeat_at");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(CronProcess {
        id: row.get("id"),
        kind: row.get("kind"),
        lane_key: lane_key.parse()?,
        status: status.parse()?,
        owner: row.get("owner"),
        params: serde_json::from_str(&params)?,
        sequence_number: row.get("sequence_number"),
        issued_sequence: row.get("issued_sequence"),
        last_heartbeat_at: last_heartbeat_at.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
