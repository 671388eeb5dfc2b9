use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use crate::http::error::ApiError;
use crate::http::state::AppState;
use crate::session::{Session, SessionOptions};
use super::validate_project_path;

#[derive(Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
    pub live: usize,
    pub max_concurrent: usize,
}

#[derive(Deserialize)]
pub struct SpawnSessionRequest {
    pub cwd: PathBuf,
    pub name: Option<String>,
    #[serde(default)]
    pub context_files: Vec<PathBuf>,
    pub initial_prompt: Option<String>,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
}

#[derive(Deserialize)]
pub struct PromptRequest {
    pub text: String,
}

#[derive(Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub session_id: String,
    pub message: String,
}

fn accepted(session_id: String, message: &str) -> (StatusCode, Json<AcceptedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            session_id,
            message: message.to_string(),
        }),
    )
}

/// GET /api/sessions - List sessions, most recently active first
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.pool.list(),
        live: state.pool.live_count(),
        max_concurrent: state.pool.max_concurrent(),
    })
}

/// POST /api/sessions - Spawn a session
pub async fn spawn_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SpawnSessionRequest>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    validate_project_path(&req.cwd)?;

    let name = req.name.unwrap_or_else(|| {
        req.cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string())
    });
    let options = SessionOptions {
        cwd: req.cwd,
        name,
        context_files: req.context_files,
        initial_prompt: req.initial_prompt,
        model: req.model,
        thinking_level: req.thinking_level,
    };

    let session = state.pool.spawn(options)?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions/{id} - Get one session
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .pool
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {}", id)))
}

/// DELETE /api/sessions/{id} - Shut a session down and remove it
pub async fn destroy_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.pool.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/sessions/{id}/prompt
pub async fn send_prompt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PromptRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::bad_request("Prompt text must not be empty"));
    }
    state.pool.send_prompt(&id, req.text)?;
    Ok(accepted(id, "Prompt sent"))
}

/// POST /api/sessions/{id}/approve
pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    state.pool.approve(&id)?;
    Ok(accepted(id, "Tool call approved"))
}

/// POST /api/sessions/{id}/reject - Body is optional
pub async fn reject(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RejectRequest>>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let reason = body.and_then(|Json(req)| req.reason);
    state.pool.reject(&id, reason)?;
    Ok(accepted(id, "Tool call rejected"))
}

/// POST /api/sessions/{id}/abort
pub async fn abort(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    state.pool.abort(&id)?;
    Ok(accepted(id, "Abort requested"))
}
