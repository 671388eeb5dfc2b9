use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{Session, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalNeeded,
    Error,
    Completed,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ApprovalNeeded => "approval_needed",
            NotificationKind::Error => "error",
            NotificationKind::Completed => "completed",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approval_needed" => Ok(NotificationKind::ApprovalNeeded),
            "error" => Ok(NotificationKind::Error),
            "completed" => Ok(NotificationKind::Completed),
            other => Err(format!("unknown notification kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNotification {
    pub session_id: String,
    pub session_name: String,
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl SessionNotification {
    pub fn for_session(session: &Session, kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            session_id: session.id.clone(),
            session_name: session.name.clone(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            tool_call: None,
        }
    }

    pub fn with_tool_call(mut self, tool_call: ToolCall) -> Self {
        self.tool_call = Some(tool_call);
        self
    }
}

/// Active notifications, at most one per `(session_id, kind)`.
#[derive(Debug, Default)]
pub struct NotificationAggregator {
    entries: HashMap<(String, NotificationKind), SessionNotification>,
    approvals: usize,
}

impl NotificationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any entry with the same session and kind
    pub fn add_notification(&mut self, notification: SessionNotification) {
        let key = (notification.session_id.clone(), notification.kind);
        let is_approval = notification.kind == NotificationKind::ApprovalNeeded;
        if self.entries.insert(key, notification).is_none() && is_approval {
            self.approvals += 1;
        }
    }

    pub fn dismiss(&mut self, session_id: &str, kind: NotificationKind) -> bool {
        let removed = self.entries.remove(&(session_id.to_string(), kind)).is_some();
        if removed && kind == NotificationKind::ApprovalNeeded {
            self.approvals -= 1;
        }
        removed
    }

    /// Remove every notification for one session; returns how many went
    pub fn dismiss_all(&mut self, session_id: &str) -> usize {
        let before = self.entries.len();
        let mut approvals_removed = 0;
        self.entries.retain(|(id, kind), _| {
            let keep = id != session_id;
            if !keep && *kind == NotificationKind::ApprovalNeeded {
                approvals_removed += 1;
            }
            keep
        });
        self.approvals -= approvals_removed;
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.approvals = 0;
    }

    /// Approvals first, then everything else; newest first within each group.
    pub fn get_notifications(&self) -> Vec<SessionNotification> {
        let mut notifications: Vec<SessionNotification> = self.entries.values().cloned().collect();
        notifications.sort_by(|a, b| {
            let a_rank = a.kind != NotificationKind::ApprovalNeeded;
            let b_rank = b.kind != NotificationKind::ApprovalNeeded;
            a_rank
                .cmp(&b_rank)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
                .then_with(|| a.session_id.cmp(&b.session_id))
                .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
        });
        notifications
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn approval_count(&self) -> usize {
        self.approvals
    }
}
