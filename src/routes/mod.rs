pub mod error;
pub mod health;
pub mod metrics;
pub mod ops;
pub mod posts;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Health and `/api/v1` routes.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/posts", post(posts::dispatch_post))
        .route(
            "/api/v1/posts/{post_id}",
            get(posts::get_post).delete(posts::delete_post),
        )
        .route("/api/v1/posts/{post_id}/progress", get(posts::get_progress))
        .route(
            "/api/v1/posts/{post_id}/aggregate",
            post(posts::force_aggregation),
        )
        .route(
            "/api/v1/channels/{channel}/groups/{group}/pending",
            get(ops::pending_entries),
        )
        .route(
            "/api/v1/dead-letters/{source}/replay",
            post(ops::replay_dead_letters),
        )
        .with_state(state)
}
