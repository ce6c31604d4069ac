use axum::extract::{Multipart, State};
use axum::Json;

use super::ApiError;
use crate::app_state::AppState;
use crate::models::api::DetectResponse;

/// POST /api/v1/detect — Detect codes on a single image.
///
/// Coordinates in the response are pixels of the uploaded image.
pub async fn detect_codes(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let mut image_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(e.body_text()))?
    {
        if field.name() == Some("image") {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::validation(e.body_text()))?;

            image::guess_format(&data)
                .map_err(|_| ApiError::validation("unsupported image format"))?;

            image_data = Some(data.to_vec());
        }
    }

    let image_data =
        image_data.ok_or_else(|| ApiError::validation("missing multipart field \"image\""))?;

    Ok(Json(state.service.detect_image(image_data).await?))
}
