//! Host endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fleetd_core::HostId;
use fleetd_core::host::{Host, SYSTEM_USER};
use fleetd_core::job::Job;
use fleetd_units::BuildingContainerImageJob;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_host))
        .route("/{id}/container-images", post(build_container_image))
        .route("/{id}/terminate", post(terminate_host))
}

async fn get_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Host>, ApiError> {
    let host = state.env.hosts().find_by_id(&HostId::new(id)).await?;
    Ok(Json(host))
}

#[derive(Debug, Deserialize)]
struct BuildContainerImageRequest {
    image_url: String,
    /// Defaults to the host's own provider.
    provider: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobCreatedResponse {
    job_id: String,
    attempt: u32,
}

async fn build_container_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<BuildContainerImageRequest>,
) -> Result<(StatusCode, Json<JobCreatedResponse>), ApiError> {
    let image_url = req.image_url.trim();
    if image_url.is_empty() {
        return Err(ApiError::BadRequest("image_url must not be empty".to_string()));
    }

    let host = state.env.hosts().find_by_id(&HostId::new(id)).await?;
    if host.status.is_terminal() {
        return Err(ApiError::Conflict(format!("host {} is terminated", host.id)));
    }

    let provider = req.provider.unwrap_or_else(|| host.provider.clone());
    let job = BuildingContainerImageJob::new(state.env.clone(), host, image_url, provider);
    state.queue.put(&job).await?;

    info!(job_id = %job.id(), host_id = %job.parent_id(), image = %image_url, "Queued container image build");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobCreatedResponse {
            job_id: job.id().to_string(),
            attempt: job.attempt(),
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct TerminateRequest {
    actor: Option<String>,
}

async fn terminate_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<TerminateRequest>>,
) -> Result<Json<Host>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let actor = req.actor.unwrap_or_else(|| SYSTEM_USER.to_string());

    let host = state
        .env
        .hosts()
        .set_terminated(&HostId::new(id), &actor)
        .await?;
    info!(host_id = %host.id, actor = %actor, "Host terminated");
    Ok(Json(host))
}
