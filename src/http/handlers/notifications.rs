use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use crate::http::error::ApiError;
use crate::http::state::AppState;
use crate::notification::{NotificationKind, SessionNotification};

#[derive(Serialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<SessionNotification>,
    pub count: usize,
    pub approval_count: usize,
}

/// GET /api/notifications - Pending approvals first, then newest first
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
) -> Json<NotificationListResponse> {
    let notifications = state.pool.get_notifications();
    Json(NotificationListResponse {
        count: notifications.len(),
        approval_count: state.pool.approval_count(),
        notifications,
    })
}

/// DELETE /api/notifications/{session_id}/{kind}
pub async fn dismiss_notification(
    State(state): State<Arc<AppState>>,
    Path((session_id, kind)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let kind: NotificationKind = kind.parse().map_err(ApiError::bad_request)?;
    if state.pool.dismiss(&session_id, kind) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "No {} notification for session {}",
            kind, session_id
        )))
    }
}
