use std::sync::Arc;

use axum::{
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use super::error::AppError;
use super::AppState;

/// Multipart field carrying the image.
const FILE_FIELD: &str = "file";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub image_size: u32,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model_loaded: state.colorizer.model_loaded(),
        image_size: state.colorizer.image_size(),
    })
}

pub async fn colorize(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Multipart error: {e}")))?
    {
        if field.name().is_some_and(|name| name != FILE_FIELD) {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        if !content_type.starts_with("image/") {
            return Err(AppError::InvalidMimeType(content_type));
        }

        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {e}")))?;

        tracing::debug!("Received {} byte {content_type} upload", data.len());

        let colorizer = state.colorizer.clone();
        let png = tokio::task::spawn_blocking(move || colorizer.colorize(&data))
            .await
            .map_err(|e| {
                tracing::error!("Inference task failed: {e}");
                AppError::colorization_failed()
            })??;

        return Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response());
    }

    Err(AppError::MissingFile)
}
