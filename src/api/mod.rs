/// HTTP API Layer
///
/// Operator and trigger endpoints on top of the engine:
/// - Start a workflow and inspect its step history
/// - List lanes and force-release a stale lane lock

use crate::error::EngineError;
use axum::http::StatusCode;

// Workflow trigger and inspection endpoints
pub mod workflows;

// Lane inspection and operator endpoints
pub mod lanes;

// Re-export router builders
pub use lanes::create_lane_routes;
pub use workflows::{create_workflow_routes, AppState};

/// HTTP status for an engine error surfaced by a handler
pub(crate) fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::Configuration(_) | EngineError::InvalidLaneKey(_) => StatusCode::BAD_REQUEST,
        EngineError::WorkflowNotFound(_)
        | EngineError::StepNotFound(_)
        | EngineError::LaneNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
