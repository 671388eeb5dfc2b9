mod bridge;
mod definition;
mod engine;
pub mod graph;
mod handle;

use thiserror::Error;

pub use bridge::{BridgeError, PoolBridge, WorkflowBridge};
pub use definition::{discover, WorkflowContext, WorkflowDefinition, WorkflowStep};
pub use engine::{WorkflowEngine, DEFAULT_RUN_RETENTION};
pub use handle::{
    ProgressEvent, StepState, StepStatus, WorkflowHandle, WorkflowRun, WorkflowStatus,
};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid workflow: {}", .issues.join("; "))]
    Validation { issues: Vec<String> },
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("step '{step_id}' failed: {message}")]
    Execution { step_id: String, message: String },
    #[error("workflow scheduler unavailable: {0}")]
    Scheduler(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
