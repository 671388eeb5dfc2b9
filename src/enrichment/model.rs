use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Workflow state category reported by the issue tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStateType {
    Triage,
    Backlog,
    Unstarted,
    Started,
    Completed,
    Canceled,
}

impl IssueStateType {
    pub fn is_closed(&self) -> bool {
        matches!(self, IssueStateType::Completed | IssueStateType::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub id: String,
    /// Human-readable key such as `ENG-123`
    pub identifier: String,
    pub title: String,
    pub state_type: IssueStateType,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    #[default]
    None,
    Pending,
    Passing,
    Failing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    ReviewRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub head_branch: String,
    pub state: PrState,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub checks: CheckStatus,
    #[serde(default)]
    pub review_decision: Option<ReviewDecision>,
    #[serde(default)]
    pub url: Option<String>,
}

impl PullRequest {
    pub fn is_open(&self) -> bool {
        self.state == PrState::Open
    }

    /// Open, out of draft and not yet approved
    pub fn awaits_review(&self) -> bool {
        self.is_open() && !self.is_draft && self.review_decision != Some(ReviewDecision::Approved)
    }
}

/// A planning document tied to an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecDoc {
    pub path: PathBuf,
    pub title: String,
    #[serde(default)]
    pub issue_identifier: Option<String>,
}
