//! Analysis submission and job status routes

use axum::{
    extract::{Multipart, Path, State},
    http::HeaderMap,
    Json,
};
use uuid::Uuid;

use partlens_shared::JobId;

use crate::{
    analysis::{AnalysisMode, JobRecord, SubmitRequest, SubmitResponse},
    error::{ApiError, ApiResult},
    routes::require_user,
    state::AppState,
};

/// Submit a paid analysis operation.
///
/// Multipart fields: `image` (required bytes), `keywords`, `artifact_url`,
/// `mode` (`interactive` | `deep`). Returns 402 with credit counts when the
/// balance is short; collaborator failures return a `retry_suggested` flag
/// and the reserved credit has already been refunded.
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<SubmitResponse>> {
    let user_id = require_user(&headers)?;

    let mut image: Option<Vec<u8>> = None;
    let mut image_filename = "upload.jpg".to_string();
    let mut keywords: Option<String> = None;
    let mut artifact_url: Option<String> = None;
    let mut mode = AnalysisMode::Interactive;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                if let Some(name) = field.file_name() {
                    image_filename = name.to_string();
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read image: {}", e)))?;
                image = Some(bytes.to_vec());
            }
            "keywords" => {
                keywords = field.text().await.ok().filter(|s| !s.is_empty());
            }
            "artifact_url" => {
                artifact_url = field.text().await.ok().filter(|s| !s.is_empty());
            }
            "mode" => {
                let value = field.text().await.unwrap_or_default();
                mode = match value.as_str() {
                    "deep" => AnalysisMode::Deep,
                    _ => AnalysisMode::Interactive,
                };
            }
            other => {
                tracing::debug!(field = %other, "Ignoring unknown multipart field");
            }
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("Missing image field".to_string()))?;
    if image.is_empty() {
        return Err(ApiError::BadRequest("Empty image upload".to_string()));
    }

    let response = state
        .orchestrator
        .submit(SubmitRequest {
            user_id,
            image,
            image_filename,
            keywords,
            artifact_url,
            mode,
        })
        .await?;

    Ok(Json(response))
}

/// Fetch one job's status and result
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    let user_id = require_user(&headers)?;
    let job = state.orchestrator.get_job(user_id, JobId(job_id)).await?;
    Ok(Json(job))
}
