pub mod auth;
pub mod config;
pub mod errors;
pub mod feature;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod registry;
pub mod relay;
pub mod state;
pub mod worker;

use axum::{
    routing::{get, post},
    Router,
};
use config::GatewayConfig;
use tracing::info;

pub fn build_state(config: &GatewayConfig) -> state::AppState {
    let state = state::AppState::new(config);
    state
        .registry
        .clone()
        .spawn_health_checks(config.health_interval);
    info!(
        worker_mode = config.worker_mode.as_str(),
        connect_timeout_secs = config.timeouts.connect.as_secs(),
        request_timeout_secs = config.timeouts.request.as_secs(),
        "gateway state configured"
    );
    state
}

pub fn build_app(state: state::AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/health/backends", get(handlers::backend_health))
        .route("/metrics", get(handlers::metrics))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .with_state(state)
}
