pub mod agents;
pub mod jobs;
pub mod sessions;

use crate::server::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Every `/api` route.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/agents", get(agents::list).post(agents::spawn))
        .route("/api/agents/{id}", get(agents::get).delete(agents::terminate))
        .route("/api/dashboard", get(agents::dashboard))
        .route("/api/jobs", get(jobs::list).post(jobs::create))
        .route(
            "/api/jobs/{id}",
            get(jobs::get).put(jobs::update).delete(jobs::remove),
        )
        .route("/api/jobs/{id}/trigger", post(jobs::trigger))
        .route("/api/jobs/{id}/history", get(jobs::history))
        .route(
            "/api/roundtable",
            get(sessions::list_roundtables).post(sessions::run_roundtable),
        )
        .route("/api/roundtable/async", post(sessions::start_roundtable))
        .route(
            "/api/roundtable/{id}",
            get(sessions::get_roundtable).delete(sessions::delete_roundtable),
        )
        .route(
            "/api/swarm",
            get(sessions::list_swarms).post(sessions::run_swarm),
        )
        .route("/api/swarm/async", post(sessions::start_swarm))
        .route(
            "/api/swarm/{id}",
            get(sessions::get_swarm).delete(sessions::delete_swarm),
        )
        .route("/api/sessions/{id}/cancel", post(sessions::cancel))
}
