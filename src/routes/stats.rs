use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::load::SystemStats;

/// GET /api/v1/system_stats — current load, queue depth and pool sizing.
pub async fn system_stats(State(state): State<AppState>) -> Json<SystemStats> {
    Json(state.service.stats())
}
