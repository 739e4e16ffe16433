use axum::extract::{Path, Query, State};
use axum::Json;

use super::error::ApiError;
use crate::app_state::AppState;
use crate::models::api::{PendingResponse, ReplayParams, ReplayResponse};

const DEFAULT_REPLAY_LIMIT: usize = 100;

/// GET /api/v1/channels/{channel}/groups/{group}/pending: consumer backlog.
pub async fn pending_entries(
    State(state): State<AppState>,
    Path((channel, group)): Path<(String, String)>,
) -> Result<Json<PendingResponse>, ApiError> {
    let entries = state.bus.pending(&channel, &group).await?;
    metrics::gauge!(
        "channel_pending_entries",
        "channel" => channel.clone(),
        "group" => group.clone()
    )
    .set(entries.len() as f64);

    Ok(Json(PendingResponse {
        count: entries.len(),
        channel,
        group,
        entries,
    }))
}

/// POST /api/v1/dead-letters/{source}/replay?limit=N
pub async fn replay_dead_letters(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(params): Query<ReplayParams>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_REPLAY_LIMIT);
    let replayed = state.replayer.replay(&source, limit).await?;
    Ok(Json(ReplayResponse { source, replayed }))
}
