use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Project path does not exist: {0}")]
    MissingPath(String),
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {command} failed: {message}")]
    Failed { command: String, message: String },
    #[error("Unexpected git worktree output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    #[serde(default)]
    pub head: String,
    #[serde(default)]
    pub is_bare: bool,
}

fn run_git_in_dir(args: &[&str], project_path: &Path) -> Result<String, GitError> {
    if !project_path.exists() {
        return Err(GitError::MissingPath(project_path.display().to_string()));
    }

    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(project_path);

    // Prevent console window from flashing on Windows
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let message = if !stderr.is_empty() { stderr } else { stdout };
        return Err(GitError::Failed {
            command: args.join(" "),
            message: if message.is_empty() {
                "no output".to_string()
            } else {
                message
            },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Worktrees of the repository containing `project_path`
pub fn list_worktrees(project_path: &Path) -> Result<Vec<WorktreeInfo>, GitError> {
    let output = run_git_in_dir(&["worktree", "list", "--porcelain"], project_path)?;
    parse_worktree_list(&output)
}

/// Parse `git worktree list --porcelain`: blank-line separated records, each
/// starting with `worktree <path>`.
pub fn parse_worktree_list(output: &str) -> Result<Vec<WorktreeInfo>, GitError> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in output.lines().map(str::trim) {
        if line.is_empty() {
            worktrees.extend(current.take());
            continue;
        }

        if let Some(path) = line.strip_prefix("worktree ") {
            worktrees.extend(current.take());
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                branch: String::new(),
                head: String::new(),
                is_bare: false,
            });
            continue;
        }

        let entry = current
            .as_mut()
            .ok_or_else(|| GitError::Parse(line.to_string()))?;

        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = branch.strip_prefix("refs/heads/").unwrap_or(branch).to_string();
        } else if line == "bare" {
            entry.is_bare = true;
        } else if line == "detached" && entry.branch.is_empty() {
            entry.branch = "detached".to_string();
        }
    }

    worktrees.extend(current);
    Ok(worktrees)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worktree_list() {
        let output = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo-wt/eng-12
HEAD 2222222222222222222222222222222222222222
branch refs/heads/alice/eng-12-search

worktree /repo-wt/scratch
HEAD 3333333333333333333333333333333333333333
detached
";
        let worktrees = parse_worktree_list(output).unwrap();
        assert_eq!(worktrees.len(), 3);
        assert_eq!(worktrees[0].path, PathBuf::from("/repo"));
        assert_eq!(worktrees[0].branch, "main");
        assert_eq!(worktrees[1].branch, "alice/eng-12-search");
        assert_eq!(worktrees[2].branch, "detached");
    }

    #[test]
    fn test_parse_bare_repo_without_trailing_blank_line() {
        let worktrees = parse_worktree_list("worktree /srv/repo.git\nbare").unwrap();
        assert_eq!(worktrees.len(), 1);
        assert!(worktrees[0].is_bare);
    }

    #[test]
    fn test_parse_rejects_orphan_attribute() {
        let err = parse_worktree_list("HEAD abc\n").unwrap_err();
        assert!(matches!(err, GitError::Parse(line) if line == "HEAD abc"));
    }

    #[test]
    fn test_missing_project_path() {
        let err = list_worktrees(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, GitError::MissingPath(_)));
    }
}
