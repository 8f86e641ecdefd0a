/// Lane operator REST API endpoints

use crate::{
    api::{status_for, workflows::AppState},
    lane::types::{CronProcess, LaneKey},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct LaneList {
    pub lanes: Vec<CronProcess>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceReleaseResponse {
    pub lane_key: String,
    /// False when the lane was already stopped
    pub released: bool,
}

pub fn create_lane_routes() -> Router<AppState> {
    Router::new()
        .route("/api/lanes", get(list_lanes))
        .route("/api/lanes/{lane_key}/force-release", post(force_release))
}

/// GET /api/lanes
async fn list_lanes(State(state): State<AppState>) -> Result<Json<LaneList>, StatusCode> {
    match state.gate.lanes().await {
        Ok(lanes) => Ok(Json(LaneList { lanes })),
        Err(e) => {
            tracing::error!("Failed to list lanes: {}", e);
            Err(status_for(&e))
        }
    }
}

/// POST /api/lanes/{lane_key}/force-release
async fn force_release(
    State(state): State<AppState>,
    Path(raw_key): Path<String>,
) -> Result<Json<ForceReleaseResponse>, StatusCode> {
    let lane_key: LaneKey = raw_key.parse().map_err(|e| status_for(&e))?;

    match state.gate.force_release(&lane_key).await {
        Ok(released) => Ok(Json(ForceReleaseResponse {
            lane_key: lane_key.to_string(),
            released,
        })),
        Err(e) => {
            tracing::error!("Failed to force-release lane {}: {}", lane_key, e);
            Err(status_for(&e))
        }
    }
}
