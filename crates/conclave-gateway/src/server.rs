use crate::middleware::{auth_middleware, AuthConfig};
use crate::routes::api_router;
use crate::stream::{roundtable_handler, swarm_handler};
use axum::{middleware as axum_mw, response::Json, routing::get, Router};
use conclave_orchestrator::Orchestrator;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// The HTTP and WebSocket surface over one [`Orchestrator`].
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(orchestrator: Arc<Orchestrator>) -> Router {
        Self::build_with_auth(orchestrator, AuthConfig::default())
    }

    /// Build the gateway. `/health` is always open; every other route
    /// requires a key when `auth` has any.
    pub fn build_with_auth(orchestrator: Arc<Orchestrator>, auth: AuthConfig) -> Router {
        let state = Arc::new(AppState { orchestrator });

        let protected = api_router()
            .route("/ws/roundtable", get(roundtable_handler))
            .route("/ws/swarm", get(swarm_handler))
            .with_state(state);
        let protected = if auth.is_enabled() {
            protected.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            protected
        };

        Router::new()
            .route("/health", get(health_handler))
            .merge(protected)
    }

    /// Serve `app` on `addr` until `shutdown` resolves.
    pub async fn serve<F>(app: Router, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Gateway listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok", "service": "conclave"}))
}
