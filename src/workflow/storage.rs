/// SQLite persistence layer for workflows and their step history
///
/// The store is the single source of truth for "what happened". Status
/// changes are compare-and-set updates so a step row can only move forward,
/// and successor rows are inserted in one transaction at most once per parent.
///
/// `updated_at` on a step tracks its last status change; the reconciliation
/// sweep measures pending/queued age from it.

use crate::{
    database::{parse_timestamp, timestamp},
    error::{EngineError, Result},
    lane::{storage::CronProcessStorage, types::LaneKey},
    workflow::types::{is_terminal_kind, StepStatus, Workflow, WorkflowKind, WorkflowStatus, WorkflowStep, INIT},
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row, SqliteConnection,
};
use uuid::Uuid;

const STEP_COLUMNS: &str = "id, workflow_id, kind, status, parent_step_id, request_params, \
     response_data, sequence_number, created_at, updated_at";

/// SQLite-based workflow storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    pool: SqlitePool,
}

/// Successor rows of a parent step and whether this call created them
#[derive(Debug, Clone)]
pub struct Successors {
    pub steps: Vec<WorkflowStep>,
    /// False when the rows already existed (re-delivery)
    pub created: bool,
}

impl WorkflowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a workflow in `inProgress` together with its `init` step
    pub async fn create_workflow(
        &self,
        kind: WorkflowKind,
        client_id: Option<i64>,
        request_params: Value,
        lane: Option<&LaneKey>,
    ) -> Result<(Workflow, WorkflowStep)> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4(),
            kind,
            client_id,
            request_params,
            status: WorkflowStatus::InProgress,
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, kind, client_id, request_params, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.kind.as_str())
        .bind(workflow.client_id)
        .bind(serde_json::to_string(&workflow.request_params)?)
        .bind(workflow.status.as_str())
        .bind(timestamp(now))
        .bind(timestamp(now))
        .execute(&mut *tx)
        .await?;

        let sequence_number = match lane {
            Some(lane) => CronProcessStorage::issue_sequence(&mut *tx, lane).await?,
            None => None,
        };
        let init = new_step(workflow.id, INIT, None, Value::Object(Default::default()), sequence_number);
        insert_step(&mut *tx, &init).await?;

        tx.commit().await?;

        tracing::info!("🆕 Created {} workflow {} (init step {})", workflow.kind, workflow.id, init.id);
        Ok((workflow, init))
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query(
            "SELECT id, kind, client_id, request_params, status, created_at, updated_at FROM workflows WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(workflow_from_row).transpose()
    }

    /// inProgress → `status`; false when the workflow was already finalized
    pub async fn finalize_workflow(&self, id: Uuid, status: WorkflowStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflows SET status = ?, updated_at = ? WHERE id = ? AND status = 'inProgress'",
        )
        .bind(status.as_str())
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get_step(&self, id: Uuid) -> Result<Option<WorkflowStep>> {
        let row = sqlx::query(&format!("SELECT {} FROM workflow_steps WHERE id = ?", STEP_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(step_from_row).transpose()
    }

    /// Full step history of a workflow in creation order
    pub async fn list_steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_steps WHERE workflow_id = ? ORDER BY created_at, rowid",
            STEP_COLUMNS
        ))
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    pub async fn children(&self, parent_step_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_steps WHERE parent_step_id = ? ORDER BY created_at, rowid",
            STEP_COLUMNS
        ))
        .bind(parent_step_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    /// Ancestors of a step, nearest first (parent, grandparent, ...)
    pub async fn ancestors(&self, step_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH RECURSIVE chain(id, parent_step_id, depth) AS (
                SELECT id, parent_step_id, 0 FROM workflow_steps WHERE id = ?
                UNION ALL
                SELECT s.id, s.parent_step_id, chain.depth + 1
                FROM workflow_steps s JOIN chain ON s.id = chain.parent_step_id
            )
            SELECT {} FROM workflow_steps JOIN chain USING (id)
            WHERE chain.depth > 0
            ORDER BY chain.depth
            "#,
            STEP_COLUMNS
                .split(", ")
                .map(|column| format!("workflow_steps.{}", column))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(step_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    /// Compare-and-set status change
    ///
    /// Only forward moves are accepted (queued → pending, pending → final);
    /// returns false when the row was not in `from`.
    pub async fn transition_step(
        &self,
        id: Uuid,
        from: StepStatus,
        to: StepStatus,
        response_data: Option<&Value>,
    ) -> Result<bool> {
        let forward = matches!(
            (from, to),
            (StepStatus::Queued, StepStatus::Pending)
                | (StepStatus::Pending, StepStatus::Processed)
                | (StepStatus::Pending, StepStatus::Failed)
                | (StepStatus::Pending, StepStatus::Timeout)
        );
        if !forward {
            return Err(EngineError::Configuration(format!(
                "Illegal step transition {} → {}",
                from.as_str(),
                to.as_str()
            )));
        }

        let response_json = response_data.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE workflow_steps
            SET status = ?, response_data = COALESCE(?, response_data), updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(response_json)
        .bind(timestamp(Utc::now()))
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record an interim response on a pending step without touching its age
    pub async fn record_pending_response(&self, id: Uuid, response_data: &Value) -> Result<()> {
        sqlx::query("UPDATE workflow_steps SET response_data = ? WHERE id = ? AND status = 'pending'")
            .bind(serde_json::to_string(response_data)?)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert `queued` successors for `parent` unless it already has children
    ///
    /// Runs in one transaction; a re-delivered parent gets its existing
    /// children back with `created == false`.
    pub async fn insert_successors(
        &self,
        parent: &WorkflowStep,
        kinds: &[String],
        lane: Option<&LaneKey>,
    ) -> Result<Successors> {
        let mut tx = self.pool.begin().await?;

        let existing: i64 =
            sqlx::query("SELECT COUNT(*) AS count FROM workflow_steps WHERE parent_step_id = ?")
                .bind(parent.id.to_string())
                .fetch_one(&mut *tx)
                .await?
                .get("count");

        if existing > 0 {
            tx.rollback().await?;
            return Ok(Successors {
                steps: self.children(parent.id).await?,
                created: false,
            });
        }

        let mut steps = Vec::with_capacity(kinds.len());
        for kind in kinds {
            // Terminals complete inline and never pass the gate
            let sequence_number = match lane {
                Some(lane) if !is_terminal_kind(kind) => {
                    CronProcessStorage::issue_sequence(&mut *tx, lane).await?
                }
                _ => None,
            };
            let step = new_step(
                parent.workflow_id,
                kind,
                Some(parent.id),
                Value::Object(Default::default()),
                sequence_number,
            );
            insert_step(&mut *tx, &step).await?;
            steps.push(step);
        }

        tx.commit().await?;
        Ok(Successors {
            steps,
            created: true,
        })
    }

    /// Fresh row for retried work: same kind, same parent, same request params
    pub async fn insert_retry(
        &self,
        original: &WorkflowStep,
        lane: Option<&LaneKey>,
    ) -> Result<WorkflowStep> {
        let mut tx = self.pool.begin().await?;
        let sequence_number = match lane {
            Some(lane) => CronProcessStorage::issue_sequence(&mut *tx, lane).await?,
            None => None,
        };
        let step = new_step(
            original.workflow_id,
            &original.kind,
            original.parent_step_id,
            original.request_params.clone(),
            sequence_number,
        );
        insert_step(&mut *tx, &step).await?;
        tx.commit().await?;
        Ok(step)
    }

    /// Number of earlier attempts of `kind` under the same parent that ended in `status`
    pub async fn count_attempts(
        &self,
        workflow_id: Uuid,
        parent_step_id: Option<Uuid>,
        kind: &str,
        status: StepStatus,
    ) -> Result<i64> {
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM workflow_steps
            WHERE workflow_id = ? AND parent_step_id IS ? AND kind = ? AND status = ?
            "#,
        )
        .bind(workflow_id.to_string())
        .bind(parent_step_id.map(|id| id.to_string()))
        .bind(kind)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(count)
    }

    /// Steps in `status` whose last status change is at or before `cutoff`, oldest first
    pub async fn steps_older_than(
        &self,
        status: StepStatus,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflow_steps WHERE status = ? AND updated_at <= ? ORDER BY updated_at LIMIT ?",
            STEP_COLUMNS
        ))
        .bind(status.as_str())
        .bind(timestamp(cutoff))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }
}

fn new_step(
    workflow_id: Uuid,
    kind: &str,
    parent_step_id: Option<Uuid>,
    request_params: Value,
    sequence_number: Option<i64>,
) -> WorkflowStep {
    let now = Utc::now();
    WorkflowStep {
        id: Uuid::new_v4(),
        workflow_id,
        kind: kind.to_string(),
        status: StepStatus::Queued,
        parent_step_id,
        request_params,
        response_data: None,
        sequence_number,
        created_at: now,
        updated_at: now,
    }
}

async fn insert_step(conn: &mut SqliteConnection, step: &WorkflowStep) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO workflow_steps ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        STEP_COLUMNS
    ))
    .bind(step.id.to_string())
    .bind(step.workflow_id.to_string())
    .bind(&step.kind)
    .bind(step.status.as_str())
    .bind(step.parent_step_id.map(|id| id.to_string()))
    .bind(serde_json::to_string(&step.request_params)?)
    .bind(step.response_data.as_ref().map(serde_json::to_string).transpose()?)
    .bind(step.sequence_number)
    .bind(timestamp(step.created_at))
    .bind(timestamp(step.updated_at))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EngineError::CorruptRecord(format!("id '{}': {}", raw, e)))
}

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow> {
    let id: String = row.get("id");
    let kind: String = row.get("kind");
    let request_params: String = row.get("request_params");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Workflow {
        id: parse_uuid(&id)?,
        kind: kind
            .parse()
            .map_err(|_| EngineError::CorruptRecord(format!("workflow kind '{}'", kind)))?,
        client_id: row.get("client_id"),
        request_params: serde_json::from_str(&request_params)?,
        status: status.parse()?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowStep> {
    let id: String = row.get("id");
    let workflow_id: String = row.get("workflow_id");
    let status: String = row.get("status");
    let parent_step_id: Option<String> = row.get("parent_step_id");
    let request_params: String = row.get("request_params");
    let response_data: Option<String> = row.get("response_data");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(WorkflowStep {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        kind: row.get("kind"),
        status: status.parse()?,
        parent_step_id: parent_step_id.as_deref().map(parse_uuid).transpose()?,
        request_params: serde_json::from_str(&request_params)?,
        response_data: response_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        sequence_number: row.get("sequence_number"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
