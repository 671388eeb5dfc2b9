//! The agent runtime seam.
//!
//! A worker asks an [`AgentRuntime`] for one [`AgentSession`] and drives it
//! with prompts. The session reports progress as [`RuntimeEvent`]s on the
//! channel handed to [`AgentSession::subscribe`].

pub mod rpc;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::SessionOptions;

pub use rpc::RpcRuntime;

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    MessageStart,
    /// A message finished; `tokens` is the usage reported for it
    MessageEnd { tokens: u64 },
    ToolCall {
        tool_name: String,
        args: serde_json::Value,
    },
}

pub type RuntimeEventSink = mpsc::UnboundedSender<RuntimeEvent>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to start agent: {0}")]
    Spawn(String),
    #[error("agent run failed: {0}")]
    Run(String),
    #[error("agent run aborted")]
    Aborted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait AgentSession: Send + Sync {
    fn subscribe(&self, sink: RuntimeEventSink);

    /// Resolves when the agent has finished the run started by `text`.
    /// An aborted run resolves with [`RuntimeError::Aborted`].
    fn prompt(&self, text: String) -> BoxFuture<'static, Result<(), RuntimeError>>;

    /// Advisory: asks the in-flight run to stop.
    fn abort(&self);

    fn dispose(&self) -> BoxFuture<'static, ()>;
}

pub trait AgentRuntime: Send + Sync {
    fn create_session(
        &self,
        options: SessionOptions,
    ) -> BoxFuture<'static, Result<Arc<dyn AgentSession>, RuntimeError>>;
}
