use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{SessionOptions, SessionStatus, ToolCall};

/// Coordinator to worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Init { options: SessionOptions },
    Prompt { text: String },
    Approve,
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    Abort,
    Shutdown,
}

/// Worker to coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    StatusChanged { status: SessionStatus },
    /// `tokens` is the delta since the previous activity report
    Activity { at: DateTime<Utc>, tokens: u64 },
    ApprovalNeeded { tool_call: ToolCall },
    Error { message: String },
    ShutdownComplete,
}
