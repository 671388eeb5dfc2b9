use axum::Json;
use serde::Deserialize;
use std::path::PathBuf;
use crate::enrichment::{enrich_issues, Enrichment, Issue, PullRequest, SpecDoc};
use crate::git::{self, WorktreeInfo};
use crate::http::error::ApiError;
use crate::session::Session;
use super::validate_project_path;

#[derive(Deserialize)]
pub struct EnrichRequest {
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub prs: Vec<PullRequest>,
    #[serde(default)]
    pub specs: Vec<SpecDoc>,
    #[serde(default)]
    pub worktrees: Vec<WorktreeInfo>,
    /// When set and no worktrees are posted, they are read from this repository
    pub project_path: Option<PathBuf>,
}

/// POST /api/enrich - Run one enrichment pass over the posted snapshots
pub async fn enrich(Json(req): Json<EnrichRequest>) -> Result<Json<Enrichment>, ApiError> {
    let worktrees = match req.project_path {
        Some(project_path) if req.worktrees.is_empty() => {
            validate_project_path(&project_path)?;
            tokio::task::spawn_blocking(move || git::list_worktrees(&project_path))
                .await
                .map_err(|e| ApiError::internal(e.to_string()))?
                .map_err(|e| ApiError::bad_request(e.to_string()))?
        }
        _ => req.worktrees,
    };

    Ok(Json(enrich_issues(
        &req.issues,
        &req.sessions,
        &req.prs,
        &req.specs,
        &worktrees,
    )))
}
