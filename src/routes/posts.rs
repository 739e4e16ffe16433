use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use super::error::ApiError;
use crate::app_state::AppState;
use crate::models::api::{DispatchRequest, DispatchResponse, ProgressResponse, TriggerResponse};
use crate::models::post::AggregatedPost;
use crate::models::progress::TriggerReason;

/// POST /api/v1/posts: fan a post's images out to the analysis stages.
pub async fn dispatch_post(
    State(state): State<AppState>,
    Json(request): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    request.validate()?;
    let response = state.dispatcher.dispatch(&request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/v1/posts/{post_id}: latest aggregated record.
pub async fn get_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<Json<AggregatedPost>, ApiError> {
    state
        .records
        .post(&post_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Post `{post_id}`")))
}

/// GET /api/v1/posts/{post_id}/progress
pub async fn get_progress(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<Json<ProgressResponse>, ApiError> {
    state
        .progress
        .get(&post_id)
        .await?
        .map(|p| Json(p.into()))
        .ok_or_else(|| ApiError::NotFound(format!("Progress for post `{post_id}`")))
}

/// POST /api/v1/posts/{post_id}/aggregate: aggregate with the results
/// available now.
pub async fn force_aggregation(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<(StatusCode, Json<TriggerResponse>), ApiError> {
    let message_id = state.triggers.force(&post_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            post_id,
            reason: TriggerReason::Forced,
            message_id,
        }),
    ))
}

/// DELETE /api/v1/posts/{post_id}: drop the post from the read model and
/// tell the indexer.
pub async fn delete_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let had_progress = state.progress.delete(&post_id).await?;
    let had_records = state.records.delete_post(&post_id).await?;
    if !had_progress && !had_records {
        return Err(ApiError::NotFound(format!("Post `{post_id}`")));
    }
    state.sync.post_deleted(&post_id).await?;
    tracing::info!(post_id = %post_id, "Post deleted");
    Ok(StatusCode::NO_CONTENT)
}
