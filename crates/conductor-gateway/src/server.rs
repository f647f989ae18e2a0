use crate::connection::ConnectionManager;
use crate::handlers;
use crate::middleware::{auth_middleware, AuthConfig};
use crate::ws::ws_handler;
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use conductor_orchestrator::Conductor;
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    /// The orchestration context every handler works on.
    pub conductor: Arc<Conductor>,
    /// Open WebSocket connections.
    pub connections: Arc<ConnectionManager>,
}

/// The main gateway server.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(conductor: Arc<Conductor>) -> Router {
        Self::build_with_auth(conductor, AuthConfig::default())
    }

    /// Build the gateway, requiring one of `auth.api_keys` when any are set.
    pub fn build_with_auth(conductor: Arc<Conductor>, auth: AuthConfig) -> Router {
        let state = Arc::new(AppState {
            conductor,
            connections: ConnectionManager::new(),
        });

        let app = Router::new()
            .route("/health", get(handlers::health))
            .route("/.well-known/agent.json", get(handlers::agent_card))
            .route("/metrics", get(handlers::metrics))
            .route("/agents", get(handlers::list_agents))
            .route("/agents/{name}", get(handlers::get_agent))
            .route("/discover", get(handlers::discover))
            .route("/delegate", post(handlers::delegate))
            .route("/communicate", post(handlers::communicate))
            .route("/negotiate", post(handlers::negotiate))
            .route("/tasks", post(handlers::submit_task))
            .route(
                "/tasks/{id}",
                get(handlers::get_task).delete(handlers::cancel_task),
            )
            .route("/ws", get(ws_handler))
            .with_state(state);

        if auth.is_enabled() {
            app.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            app
        }
    }
}
