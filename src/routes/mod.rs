pub mod detect;
pub mod extract;
pub mod health;
pub mod metrics;
pub mod stats;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::{AppState, MetricsState};
use crate::models::api::{ErrorBody, ErrorDetail};
use crate::models::error::ErrorKind;
use crate::services::pipeline::ServiceError;

/// Seconds clients are asked to wait after an overload rejection.
const RETRY_AFTER_SECS: &str = "5";

/// Builds the HTTP surface. `/metrics` is mounted only when a recorder handle is given.
pub fn router(state: AppState, metrics: Option<MetricsState>) -> Router {
    let limit = state.max_upload_bytes;

    let mut app = Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/extract", post(extract::submit_document))
        .route("/api/v1/extract/{job_id}", get(extract::get_job_status))
        .route("/api/v1/detect", post(detect::detect_codes))
        .route("/api/v1/system_stats", get(stats::system_stats))
        .with_state(state);

    if let Some(handle) = metrics {
        app = app.route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(handle),
        );
    }

    app.layer(DefaultBodyLimit::max(limit))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(limit))
}

/// Structured error response: `{"error": {"kind", "message", "job_id"?}}`.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError(ServiceError::Validation(message.into()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::SystemOverloaded => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() && kind != ErrorKind::SystemOverloaded {
            tracing::error!(kind = %kind, error = %self.0, "Request failed");
        }

        let body = Json(ErrorBody {
            error: ErrorDetail {
                kind,
                message: self.0.to_string(),
                job_id: self.0.job_id(),
            },
        });

        if kind == ErrorKind::SystemOverloaded {
            (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
