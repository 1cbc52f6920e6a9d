mod auth;
mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use switchyard_core::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// All public endpoints, behind the optional inbound auth gate.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = AppState { orchestrator };
    Router::new()
        .route("/v1/messages", post(handlers::messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::count_tokens),
        )
        .route("/health", get(handlers::health))
        .route("/providers", get(handlers::providers))
        .route("/providers/reload", post(handlers::reload))
        .route("/oauth/status", get(handlers::oauth_status))
        .route("/oauth/exchange-code", post(handlers::oauth_exchange_code))
        .route("/oauth/refresh-token", post(handlers::oauth_refresh))
        .route("/oauth/tokens/{email}", delete(handlers::oauth_delete))
        .route("/oauth/tokens", delete(handlers::oauth_clear))
        .layer(middleware::from_fn_with_state(state.clone(), auth::gate))
        .with_state(state)
}
