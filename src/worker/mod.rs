//! The isolated side of a session.
//!
//! Each worker is a tokio task that owns its agent session outright. It talks
//! to its handle only through [`WorkerCommand`] and [`WorkerEvent`] messages.

pub mod protocol;

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::runtime::{AgentRuntime, AgentSession, RuntimeError, RuntimeEvent};
use crate::session::{PoolError, SessionStatus, ToolCall};

pub use protocol::{WorkerCommand, WorkerEvent};

type Run = BoxFuture<'static, Result<(), RuntimeError>>;

struct Worker {
    name: String,
    status: SessionStatus,
    events: mpsc::UnboundedSender<WorkerEvent>,
    session: Option<Arc<dyn AgentSession>>,
    run: Option<Run>,
}

/// Worker main loop. Returns after `shutdown_complete` has been sent.
pub async fn run(
    runtime: Arc<dyn AgentRuntime>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let mut worker = Worker {
        name: String::new(),
        status: SessionStatus::Starting,
        events,
        session: None,
        run: None,
    };

    let options = loop {
        match commands.recv().await {
            Some(WorkerCommand::Init { options }) => break options,
            Some(WorkerCommand::Shutdown) | None => {
                worker.shutdown().await;
                return;
            }
            Some(other) => debug!("Worker ignoring {:?} before init", other),
        }
    };

    worker.name = options.name.clone();
    let initial_prompt = options.initial_prompt.clone();
    let (runtime_tx, mut runtime_rx) = mpsc::unbounded_channel();

    match runtime.create_session(options).await {
        Ok(session) => {
            session.subscribe(runtime_tx);
            worker.session = Some(session);
            worker.set_status(SessionStatus::Idle);
            info!("Session '{}' ready", worker.name);
            if let Some(prompt) = initial_prompt {
                worker.start_prompt(prompt);
            }
        }
        Err(e) => {
            drop(runtime_tx);
            worker.fail(PoolError::SessionSpawn(e.to_string()).to_string());
        }
    }

    loop {
        tokio::select! {
            biased;
            Some(event) = runtime_rx.recv() => worker.handle_runtime_event(event),
            command = commands.recv() => match command {
                Some(WorkerCommand::Shutdown) | None => break,
                Some(command) => worker.handle_command(command),
            },
            result = worker.settle_run(), if worker.run.is_some() => {
                // Events sent while the run was finishing belong before the status change.
                while let Ok(event) = runtime_rx.try_recv() {
                    worker.handle_runtime_event(event);
                }
                worker.finish_run(result);
            }
        }
    }

    worker.shutdown().await;
}

impl Worker {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    /// Move along the lifecycle graph. Returns false when the edge does not exist.
    fn set_status(&mut self, next: SessionStatus) -> bool {
        if next == self.status {
            return true;
        }
        if !self.status.can_transition_to(next) {
            debug!(
                "Session '{}' staying {} (no edge to {})",
                self.name, self.status, next
            );
            return false;
        }
        self.status = next;
        self.emit(WorkerEvent::StatusChanged { status: next });
        true
    }

    fn fail(&mut self, message: String) {
        warn!("Session '{}' failed: {}", self.name, message);
        self.set_status(SessionStatus::Error);
        self.emit(WorkerEvent::Error { message });
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Init { .. } => warn!("Session '{}' already initialised", self.name),
            WorkerCommand::Prompt { text } => self.start_prompt(text),
            WorkerCommand::Approve => {
                if self.status == SessionStatus::Approval {
                    self.set_status(SessionStatus::Working);
                }
            }
            WorkerCommand::Reject { reason } => {
                if self.status == SessionStatus::Approval {
                    info!(
                        "Session '{}' tool call rejected: {}",
                        self.name,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    self.set_status(SessionStatus::Working);
                    if let Some(session) = &self.session {
                        session.abort();
                    }
                }
            }
            WorkerCommand::Abort => {
                if let (Some(session), Some(_)) = (&self.session, &self.run) {
                    session.abort();
                }
            }
            WorkerCommand::Shutdown => {}
        }
    }

    fn start_prompt(&mut self, text: String) {
        let Some(session) = self.session.clone() else {
            self.emit(WorkerEvent::Error {
                message: "agent session is not available".to_string(),
            });
            return;
        };
        if self.run.is_some() {
            self.emit(WorkerEvent::Error {
                message: "a prompt is already running".to_string(),
            });
            return;
        }
        if !self.set_status(SessionStatus::Working) {
            self.emit(WorkerEvent::Error {
                message: format!("cannot accept a prompt while {}", self.status),
            });
            return;
        }

        debug!("Session '{}' prompt: {} chars", self.name, text.len());
        self.run = Some(session.prompt(text));
    }

    fn handle_runtime_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::MessageStart => self.emit(WorkerEvent::Activity {
                at: Utc::now(),
                tokens: 0,
            }),
            RuntimeEvent::MessageEnd { tokens } => self.emit(WorkerEvent::Activity {
                at: Utc::now(),
                tokens,
            }),
            RuntimeEvent::ToolCall { tool_name, args } => {
                self.emit(WorkerEvent::Activity {
                    at: Utc::now(),
                    tokens: 0,
                });
                if self.set_status(SessionStatus::Approval) {
                    self.emit(WorkerEvent::ApprovalNeeded {
                        tool_call: ToolCall { tool_name, args },
                    });
                }
            }
        }
    }

    async fn settle_run(&mut self) -> Result<(), RuntimeError> {
        match self.run.as_mut() {
            Some(run) => run.await,
            None => std::future::pending().await,
        }
    }

    fn finish_run(&mut self, result: Result<(), RuntimeError>) {
        self.run = None;
        match result {
            Ok(()) | Err(RuntimeError::Aborted) => {
                if self.status == SessionStatus::Approval {
                    self.set_status(SessionStatus::Working);
                }
                self.set_status(SessionStatus::Idle);
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    async fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            if self.run.take().is_some() {
                session.abort();
            }
            session.dispose().await;
        }
        self.set_status(SessionStatus::Shutdown);
        self.emit(WorkerEvent::ShutdownComplete);
        info!("Session '{}' worker stopped", self.name);
    }
}
