//! Cross-references sessions, pull requests, spec documents and worktrees
//! against tracked issues. Every pass is computed from scratch; nothing here
//! holds state between calls.

mod model;

pub use model::{
    CheckStatus, Issue, IssueStateType, PrState, PullRequest, ReviewDecision, SpecDoc,
};

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::git::WorktreeInfo;
use crate::session::{Session, SessionStatus};

/// `LETTERS-NUMBER` at the start of the text or right after a separator
static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|[/_\s\[(:])([a-z]+-\d+)").expect("Invalid identifier regex")
});

/// Display grouping. Declaration order is display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Attention,
    Active,
    Backlog,
    Unlinked,
}

/// Single status token per issue. Declaration order is priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Badge {
    #[serde(rename = "apprvl")]
    Approval,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "wrkng")]
    Working,
    #[serde(rename = "review")]
    Review,
    #[serde(rename = "ci:fail")]
    CiFail,
    #[serde(rename = "spec")]
    Spec,
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "ci:pass")]
    CiPass,
    #[serde(rename = "merged")]
    Merged,
    #[serde(rename = "--")]
    None,
}

impl Badge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::Approval => "apprvl",
            Badge::Error => "error",
            Badge::Done => "done",
            Badge::Working => "wrkng",
            Badge::Review => "review",
            Badge::CiFail => "ci:fail",
            Badge::Spec => "spec",
            Badge::Idle => "idle",
            Badge::Draft => "draft",
            Badge::CiPass => "ci:pass",
            Badge::Merged => "merged",
            Badge::None => "--",
        }
    }
}

impl std::fmt::Display for Badge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedIssue {
    pub issue: Issue,
    pub sessions: Vec<Session>,
    pub pr: Option<PullRequest>,
    pub spec: Option<SpecDoc>,
    pub worktree: Option<WorktreeInfo>,
    pub section: Section,
    pub badge: Badge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnlinkedItem {
    Session { session: Session },
    PullRequest { pr: PullRequest },
}

impl UnlinkedItem {
    pub fn section(&self) -> Section {
        Section::Unlinked
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub issues: Vec<EnrichedIssue>,
    pub unlinked: Vec<UnlinkedItem>,
}

pub fn enrich_issues(
    issues: &[Issue],
    sessions: &[Session],
    prs: &[PullRequest],
    specs: &[SpecDoc],
    worktrees: &[WorktreeInfo],
) -> Enrichment {
    let session_branches: Vec<Option<&str>> = sessions
        .iter()
        .map(|session| worktree_for(&session.cwd, worktrees).map(|wt| wt.branch.as_str()))
        .collect();

    let mut session_linked = vec![false; sessions.len()];
    let mut pr_linked = vec![false; prs.len()];

    let mut enriched: Vec<EnrichedIssue> = issues
        .iter()
        .map(|issue| {
            let branch = issue.branch_name.as_deref().filter(|b| !b.is_empty());

            let mut linked_sessions = Vec::new();
            if let Some(branch) = branch {
                for (index, session) in sessions.iter().enumerate() {
                    if session_branches[index] == Some(branch) {
                        session_linked[index] = true;
                        linked_sessions.push(session.clone());
                    }
                }
            }

            let pr = prs
                .iter()
                .position(|pr| pr_matches(issue, branch, pr))
                .map(|index| {
                    pr_linked[index] = true;
                    prs[index].clone()
                });

            let spec = specs
                .iter()
                .find(|spec| {
                    spec.issue_identifier
                        .as_deref()
                        .is_some_and(|id| id.eq_ignore_ascii_case(&issue.identifier))
                })
                .cloned();

            let worktree = branch.and_then(|branch| {
                worktrees
                    .iter()
                    .find(|wt| !wt.is_bare && wt.branch == branch)
                    .cloned()
            });

            let section = section_for(issue, &linked_sessions, pr.as_ref());
            let badge = badge_for(issue, &linked_sessions, pr.as_ref(), spec.as_ref());

            EnrichedIssue {
                issue: issue.clone(),
                sessions: linked_sessions,
                pr,
                spec,
                worktree,
                section,
                badge,
            }
        })
        .collect();

    // Stable, so equal keys keep input order
    enriched.sort_by_key(|item| (item.section, item.badge));

    let unlinked = sessions
        .iter()
        .zip(&session_linked)
        .filter(|(_, linked)| !**linked)
        .map(|(session, _)| UnlinkedItem::Session {
            session: session.clone(),
        })
        .chain(
            prs.iter()
                .zip(&pr_linked)
                .filter(|(_, linked)| !**linked)
                .map(|(pr, _)| UnlinkedItem::PullRequest { pr: pr.clone() }),
        )
        .collect();

    Enrichment {
        issues: enriched,
        unlinked,
    }
}

/// Identifiers mentioned in a branch name or title, in order
pub fn extract_identifiers(text: &str) -> Vec<String> {
    IDENTIFIER_REGEX
        .captures_iter(text)
        .map(|caps| caps[1].to_uppercase())
        .collect()
}

fn mentions(text: &str, identifier: &str) -> bool {
    IDENTIFIER_REGEX
        .captures_iter(text)
        .any(|caps| caps[1].eq_ignore_ascii_case(identifier))
}

fn pr_matches(issue: &Issue, branch: Option<&str>, pr: &PullRequest) -> bool {
    branch == Some(pr.head_branch.as_str())
        || mentions(&pr.head_branch, &issue.identifier)
        || mentions(&pr.title, &issue.identifier)
}

/// Innermost worktree containing `cwd`
fn worktree_for<'a>(cwd: &Path, worktrees: &'a [WorktreeInfo]) -> Option<&'a WorktreeInfo> {
    worktrees
        .iter()
        .filter(|wt| !wt.is_bare && cwd.starts_with(&wt.path))
        .max_by_key(|wt| wt.path.components().count())
}

fn section_for(issue: &Issue, sessions: &[Session], pr: Option<&PullRequest>) -> Section {
    let any = |statuses: &[SessionStatus]| sessions.iter().any(|s| statuses.contains(&s.status));

    if any(&[SessionStatus::Approval, SessionStatus::Error, SessionStatus::Idle]) {
        Section::Attention
    } else if any(&[SessionStatus::Working, SessionStatus::Starting])
        || pr.is_some_and(PullRequest::is_open)
        || issue.state_type == IssueStateType::Started
    {
        Section::Active
    } else {
        Section::Backlog
    }
}

fn badge_for(
    issue: &Issue,
    sessions: &[Session],
    pr: Option<&PullRequest>,
    spec: Option<&SpecDoc>,
) -> Badge {
    let has = |status: SessionStatus| sessions.iter().any(|s| s.status == status);
    let open_pr = pr.filter(|pr| pr.is_open());

    let candidates = [
        (has(SessionStatus::Approval), Badge::Approval),
        (has(SessionStatus::Error), Badge::Error),
        (issue.state_type == IssueStateType::Completed, Badge::Done),
        (
            has(SessionStatus::Working) || has(SessionStatus::Starting),
            Badge::Working,
        ),
        (open_pr.is_some_and(PullRequest::awaits_review), Badge::Review),
        (
            open_pr.is_some_and(|pr| pr.checks == CheckStatus::Failing),
            Badge::CiFail,
        ),
        (spec.is_some(), Badge::Spec),
        (has(SessionStatus::Idle), Badge::Idle),
        (open_pr.is_some_and(|pr| pr.is_draft), Badge::Draft),
        (
            open_pr.is_some_and(|pr| pr.checks == CheckStatus::Passing),
            Badge::CiPass,
        ),
        (pr.is_some_and(|pr| pr.state == PrState::Merged), Badge::Merged),
    ];

    candidates
        .into_iter()
        .filter(|(applies, _)| *applies)
        .map(|(_, badge)| badge)
        .min()
        .unwrap_or(Badge::None)
}
