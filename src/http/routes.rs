use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use crate::http::state::AppState;
use crate::http::handlers::{enrich, health, notifications, sessions, workflows};

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::spawn_session),
        )
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::destroy_session),
        )
        .route("/api/sessions/{id}/prompt", post(sessions::send_prompt))
        .route("/api/sessions/{id}/approve", post(sessions::approve))
        .route("/api/sessions/{id}/reject", post(sessions::reject))
        .route("/api/sessions/{id}/abort", post(sessions::abort))
        // Notification routes
        .route("/api/notifications", get(notifications::list_notifications))
        .route(
            "/api/notifications/{session_id}/{kind}",
            delete(notifications::dismiss_notification),
        )
        // Workflow routes
        .route("/api/workflows", get(workflows::list_workflows))
        .route("/api/workflows/{id}/run", post(workflows::run_workflow))
        .route("/api/runs", get(workflows::list_runs))
        .route("/api/runs/{id}", get(workflows::get_run))
        .route("/api/runs/{id}/abort", post(workflows::abort_run))
        .route("/api/enrich", post(enrich::enrich))
        .layer(cors)
        .with_state(state)
}
