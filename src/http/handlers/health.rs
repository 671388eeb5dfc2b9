use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::http::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub api_version: String,
    pub live_sessions: usize,
    pub max_concurrent: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: "v1".to_string(),
        live_sessions: state.pool.live_count(),
        max_concurrent: state.pool.max_concurrent(),
    })
}
