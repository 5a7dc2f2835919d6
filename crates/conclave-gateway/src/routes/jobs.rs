//! Job CRUD, manual triggers and run history.

use crate::error::ApiResult;
use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use conclave_orchestrator::{CronJob, JobDefinition, JobRun};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// `?offset=&limit=` for history pages.
#[derive(Debug, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<CronJob>>> {
    Ok(Json(state.orchestrator.scheduler().list().await?))
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<JobDefinition>,
) -> ApiResult<(StatusCode, Json<CronJob>)> {
    let job = state.orchestrator.scheduler().add(definition).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CronJob>> {
    Ok(Json(state.orchestrator.scheduler().get(id).await?))
}

pub async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(definition): Json<JobDefinition>,
) -> ApiResult<Json<CronJob>> {
    Ok(Json(state.orchestrator.scheduler().update(id, definition).await?))
}

pub async fn remove(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.orchestrator.scheduler().remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobRun>> {
    Ok(Json(state.orchestrator.scheduler().trigger(id).await?))
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Vec<JobRun>>> {
    let runs = state
        .orchestrator
        .scheduler()
        .history(id, page.offset, page.limit)
        .await?;
    Ok(Json(runs))
}
