use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub monitor: ComponentHealth,
    pub workers: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub detail: String,
}

impl ComponentHealth {
    fn new(ok: bool, detail: String) -> Self {
        Self {
            status: if ok { "ok" } else { "error" }.to_string(),
            detail,
        }
    }
}

/// GET /health — load monitor freshness and job worker liveness.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = state.service.health();

    let monitor = ComponentHealth::new(
        health.monitor_fresh,
        format!("last sample {} ms ago", health.sample_age_ms),
    );
    let workers = ComponentHealth::new(
        health.started && health.workers_alive == health.workers_expected,
        format!("{}/{} job workers running", health.workers_alive, health.workers_expected),
    );

    let all_healthy = health.is_healthy();
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { monitor, workers },
    };

    (status_code, Json(response))
}
