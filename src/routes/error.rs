use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::StoreError;
use crate::services::bus::BusError;
use crate::services::dispatcher::DispatchError;
use crate::services::replay::ReplayError;
use crate::services::tracker::TrackerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::NotFound(_)
            | ApiError::Tracker(TrackerError::UnknownPost(_))
            | ApiError::Replay(ReplayError::UnknownSource(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Validation(_) | ApiError::Dispatch(DispatchError::DuplicateImage(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR")
            }
            _ => {
                tracing::error!(error = %self, "Request failed");
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
        };

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}
