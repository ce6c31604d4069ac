use axum::extract::State;
use axum::response::IntoResponse;

use crate::app_state::MetricsState;

/// GET /metrics — Prometheus text exposition of pipeline metrics.
pub async fn prometheus_metrics(State(handle): State<MetricsState>) -> impl IntoResponse {
    handle.render()
}
