use crate::error::ApiResult;
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use conclave_orchestrator::{AgentSpec, AgentSummary};
use std::sync::Arc;

pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<AgentSummary>> {
    Json(state.orchestrator.list_agents().await)
}

/// Register an agent, or refresh the persona of an existing one.
pub async fn spawn(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<AgentSpec>,
) -> ApiResult<(StatusCode, Json<AgentSummary>)> {
    let summary = state.orchestrator.spawn_agent(&spec).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AgentSummary>> {
    Ok(Json(state.orchestrator.agent(&id).await?))
}

pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.orchestrator.terminate_agent(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn dashboard(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.orchestrator.dashboard().await)
}
