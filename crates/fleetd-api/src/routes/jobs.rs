//! Job endpoints.
//!
//! Job ids may contain `/` (image references do); clients percent-encode it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleetd_core::JobId;
use fleetd_scheduler::QueueEntry;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_job))
        .route("/{id}/cancel", post(cancel_job))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueEntry>, ApiError> {
    let entry = state.queue.get(&JobId::new(id)).await?;
    Ok(Json(entry))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.queue.cancel(&JobId::new(id)).await?;
    Ok(StatusCode::ACCEPTED)
}
