use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionStatus;

/// Snapshot of one session as seen by the pool and the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub last_activity_at: DateTime<Utc>,
    pub token_count: u64,
}

/// Everything the worker needs to start an agent session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub name: String,
    #[serde(default)]
    pub context_files: Vec<PathBuf>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub thinking_level: Option<String>,
}

impl SessionOptions {
    pub fn new(cwd: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            cwd: cwd.into(),
            name: name.into(),
            context_files: Vec::new(),
            initial_prompt: None,
            model: None,
            thinking_level: None,
        }
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A tool invocation waiting for the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}
