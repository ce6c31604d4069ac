use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use uuid::Uuid;

use super::ApiError;
use crate::app_state::AppState;
use crate::models::api::{SubmitOptions, Submission};
use crate::models::job::JobView;

/// Multipart field names accepted for the document.
const DOCUMENT_FIELDS: [&str; 2] = ["file", "document"];

/// POST /api/v1/extract — Upload a PDF for code extraction.
///
/// Query: `timeout` (seconds) and `async` (default `true`). Asynchronous
/// submissions answer 202 with the job id; `async=false` answers 200 with the
/// terminal job view, or 408 if the job outlives the timeout.
pub async fn submit_document(
    State(state): State<AppState>,
    options: Result<Query<SubmitOptions>, QueryRejection>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let Query(options) = options.map_err(|e| ApiError::validation(e.body_text()))?;

    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(e.body_text()))?
    {
        if field.name().is_some_and(|name| DOCUMENT_FIELDS.contains(&name)) {
            let source = field.file_name().unwrap_or("document.pdf").to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::validation(e.body_text()))?;
            upload = Some((source, data.to_vec()));
        }
    }

    let (source, bytes) =
        upload.ok_or_else(|| ApiError::validation("missing multipart field \"file\""))?;

    let response = match state.service.submit(&source, &bytes, options).await? {
        Submission::Accepted(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Submission::Finished(view) => (StatusCode::OK, Json(view)).into_response(),
    };
    Ok(response)
}

/// GET /api/v1/extract/{job_id} — Check an extraction job.
pub async fn get_job_status(
    State(state): State<AppState>,
    job_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<JobView>, ApiError> {
    let Path(job_id) = job_id.map_err(|e| ApiError::validation(e.body_text()))?;
    Ok(Json(state.service.status(job_id)?))
}
