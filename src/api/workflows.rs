/// Workflow trigger REST API endpoints
///
/// Starts workflows through the router and exposes a workflow with its full
/// step history for operators.

use crate::{
    api::status_for,
    lane::gate::SequenceGate,
    runtime::router::WorkflowRouter,
    workflow::types::{Workflow, WorkflowKind, WorkflowStep},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Step-advancing engine, also owns workflow storage
    pub router: Arc<WorkflowRouter>,
    /// Lane lock and sequence gate
    pub gate: Arc<SequenceGate>,
}

/// Request body for starting a workflow
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowRequest {
    pub kind: WorkflowKind,
    #[serde(default)]
    pub client_id: Option<i64>,
    #[serde(default)]
    pub request_params: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartWorkflowResponse {
    pub workflow_id: Uuid,
    pub init_step_id: Uuid,
    pub lane_key: String,
}

#[derive(Debug, Serialize)]
pub struct WorkflowDetail {
    pub workflow: Workflow,
    pub steps: Vec<WorkflowStep>,
}

/// Create workflow trigger routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(start_workflow))
        .route("/api/workflows/{id}", get(get_workflow))
}

/// Start a workflow
///
/// POST /api/workflows
/// Body: { "kind": "test", "clientId": 1, "requestParams": { ... } }
async fn start_workflow(
    State(state): State<AppState>,
    Json(payload): Json<StartWorkflowRequest>,
) -> Result<Json<StartWorkflowResponse>, StatusCode> {
    let request_params = match payload.request_params {
        Value::Null => Value::Object(Default::default()),
        Value::Object(fields) => Value::Object(fields),
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    match state
        .router
        .start(payload.kind, payload.client_id, request_params)
        .await
    {
        Ok((workflow, init)) => Ok(Json(StartWorkflowResponse {
            workflow_id: workflow.id,
            init_step_id: init.id,
            lane_key: WorkflowRouter::lane_for(&workflow).to_string(),
        })),
        Err(e) => {
            tracing::error!("Failed to start {} workflow: {}", payload.kind, e);
            Err(status_for(&e))
        }
    }
}

/// Get a workflow with its step history
///
/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkflowDetail>, StatusCode> {
    let storage = state.router.storage();

    let workflow = match storage.get_workflow(id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load workflow {}: {}", id, e);
            return Err(status_for(&e));
        }
    };

    let steps = storage.list_steps(id).await.map_err(|e| {
        tracing::error!("Failed to load steps of workflow {}: {}", id, e);
        status_for(&e)
    })?;

    Ok(Json(WorkflowDetail { workflow, steps }))
}
