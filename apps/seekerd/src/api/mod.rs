//! HTTP API for the daemon.

pub mod network;
pub mod transfers;

use axum::{extract::DefaultBodyLimit, extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::DaemonState;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub message: String,
    pub version: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        message: "seekerd is running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_state(State(state): State<AppState>) -> Json<DaemonState> {
    Json((*state.state.current()).clone())
}

/// Assemble the full router.
pub fn router(app: AppState) -> Router {
    let body_limit = app.options.current().relay.max_file_size as usize;

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v0/state", get(get_state))
        .nest("/api/v0/transfers", transfers::router())
        .nest(
            "/api/v0/network",
            network::router().layer(DefaultBodyLimit::max(body_limit)),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}
