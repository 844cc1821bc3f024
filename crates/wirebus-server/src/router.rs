//! Axum router wiring (HTTP -> WS upgrade + ops endpoints).

use axum::{routing::get, Router};

use crate::{ops, server::AppState, transport};

pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(transport::ws::ws_upgrade))
        .route("/healthz", get(ops::healthz))
        .route("/stats", get(ops::stats))
        .with_state(state)
}
