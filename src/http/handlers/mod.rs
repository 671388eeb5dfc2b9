pub mod enrich;
pub mod health;
pub mod notifications;
pub mod sessions;
pub mod workflows;

use std::path::Path;

use crate::http::error::ApiError;

/// Reject traversal sequences and anything that is not an existing directory
pub fn validate_project_path(path: &Path) -> Result<(), ApiError> {
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(ApiError::bad_request(
            "Invalid project path: must not contain '..' (path traversal)",
        ));
    }

    if !path.exists() {
        return Err(ApiError::bad_request(format!(
            "Project path does not exist: {}",
            path.display()
        )));
    }
    if !path.is_dir() {
        return Err(ApiError::bad_request(format!(
            "Project path is not a directory: {}",
            path.display()
        )));
    }

    Ok(())
}
