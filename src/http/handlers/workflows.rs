use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use crate::http::error::ApiError;
use crate::http::state::AppState;
use crate::workflow::{WorkflowContext, WorkflowDefinition, WorkflowRun};
use super::validate_project_path;

#[derive(Serialize)]
pub struct WorkflowListResponse {
    pub workflows: Vec<WorkflowDefinition>,
}

#[derive(Deserialize)]
pub struct RunWorkflowRequest {
    pub cwd: PathBuf,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Serialize)]
pub struct RunListResponse {
    pub runs: Vec<WorkflowRun>,
}

/// GET /api/workflows - Discovered and registered definitions
pub async fn list_workflows(State(state): State<Arc<AppState>>) -> Json<WorkflowListResponse> {
    Json(WorkflowListResponse {
        workflows: state.engine.list(),
    })
}

/// POST /api/workflows/{id}/run - Start a run; progress is polled via /api/runs/{id}
pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RunWorkflowRequest>,
) -> Result<(StatusCode, Json<WorkflowRun>), ApiError> {
    validate_project_path(&req.cwd)?;

    let context = WorkflowContext {
        cwd: req.cwd,
        variables: req.variables,
        workflow_id: None,
    };
    let handle = state.engine.run(&id, context)?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot())))
}

/// GET /api/runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<RunListResponse> {
    Json(RunListResponse {
        runs: state.engine.runs(),
    })
}

/// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowRun>, ApiError> {
    state
        .engine
        .get_run(&id)
        .map(|handle| Json(handle.snapshot()))
        .ok_or_else(|| ApiError::not_found(format!("Run not found: {}", id)))
}

/// POST /api/runs/{id}/abort - Stops the run before its next wave
pub async fn abort_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<WorkflowRun>), ApiError> {
    let handle = state
        .engine
        .get_run(&id)
        .ok_or_else(|| ApiError::not_found(format!("Run not found: {}", id)))?;
    handle.abort();
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot())))
}
