//! Operational HTTP endpoints.
//!
//! - `/healthz` : liveness
//! - `/stats`   : JSON snapshot of connection/message/task counters

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::server::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats_snapshot())
}
