//! Roundtable and swarm sessions: synchronous and background starts,
//! listing, lookup, deletion and cancellation.

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use conclave_core::ConclaveError;
use conclave_orchestrator::{RoundtableRequest, RoundtableResult, SwarmRequest, SwarmResult};
use conclave_session::{SessionKind, SessionRecord};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub async fn run_roundtable(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RoundtableRequest>,
) -> ApiResult<Json<RoundtableResult>> {
    Ok(Json(state.orchestrator.run_roundtable(&request).await?))
}

pub async fn start_roundtable(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RoundtableRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = state.orchestrator.start_roundtable(&request).await?;
    Ok(accepted(id))
}

pub async fn run_swarm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwarmRequest>,
) -> ApiResult<Json<SwarmResult>> {
    Ok(Json(state.orchestrator.run_swarm(&request).await?))
}

pub async fn start_swarm(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwarmRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = state.orchestrator.start_swarm(&request).await?;
    Ok(accepted(id))
}

fn accepted(session_id: Uuid) -> (StatusCode, Json<Value>) {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "session_id": session_id, "status": "running" })),
    )
}

pub async fn list_roundtables(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<SessionRecord>>> {
    Ok(Json(state.orchestrator.list_sessions(SessionKind::Roundtable).await?))
}

pub async fn list_swarms(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<SessionRecord>>> {
    Ok(Json(state.orchestrator.list_sessions(SessionKind::Swarm).await?))
}

pub async fn get_roundtable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionRecord>> {
    Ok(Json(session_of_kind(&state, id, SessionKind::Roundtable).await?))
}

pub async fn get_swarm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionRecord>> {
    Ok(Json(session_of_kind(&state, id, SessionKind::Swarm).await?))
}

pub async fn delete_roundtable(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    session_of_kind(&state, id, SessionKind::Roundtable).await?;
    state.orchestrator.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_swarm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    session_of_kind(&state, id, SessionKind::Swarm).await?;
    state.orchestrator.delete_session(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.orchestrator.cancel_session(id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "session_id": id, "status": "cancelling" })),
    ))
}

async fn session_of_kind(
    state: &AppState,
    id: Uuid,
    kind: SessionKind,
) -> Result<SessionRecord, ApiError> {
    let record = state.orchestrator.get_session(id).await?;
    if record.session_type != kind {
        return Err(ConclaveError::NotFound(format!("{kind} session {id}")).into());
    }
    Ok(record)
}
