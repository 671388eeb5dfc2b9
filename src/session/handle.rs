use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{PoolError, Session, SessionOptions, SessionStatus, ToolCall};
use crate::listeners::{isolate, ListenerSet, Subscription};
use crate::runtime::AgentRuntime;
use crate::worker::{self, WorkerCommand, WorkerEvent};

/// Default time a worker gets to acknowledge shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Typed view of the worker's messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Carries the accumulated totals after the activity was applied
    Activity {
        last_activity_at: DateTime<Utc>,
        token_count: u64,
    },
    ApprovalNeeded {
        tool_call: ToolCall,
    },
    Error {
        message: String,
    },
    ShutdownComplete,
}

type EventHandler = dyn Fn(&SessionEvent) + Send + Sync;

struct LiveState {
    status: SessionStatus,
    last_activity_at: DateTime<Utc>,
    token_count: u64,
}

/// Coordinator-side proxy for one isolated session worker
pub struct SessionHandle {
    id: String,
    name: String,
    cwd: PathBuf,
    started_at: DateTime<Utc>,
    state: Arc<RwLock<LiveState>>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    listeners: Arc<ListenerSet<EventHandler>>,
    attached: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
    disposed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    startup_failure: Mutex<Vec<SessionEvent>>,
    shutdown_timeout: Duration,
}

impl SessionHandle {
    /// Spawn the worker and send it `init`.
    ///
    /// Never fails: when no worker can be started the handle comes back in
    /// `error` and replays the failure to its first event handler.
    pub fn spawn(
        runtime: Arc<dyn AgentRuntime>,
        options: SessionOptions,
        shutdown_timeout: Duration,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let name = options.name.clone();
        let cwd = options.cwd.clone();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (attached_tx, attached_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let state = Arc::new(RwLock::new(LiveState {
            status: SessionStatus::Starting,
            last_activity_at: now,
            token_count: 0,
        }));
        let listeners: Arc<ListenerSet<EventHandler>> = Arc::new(ListenerSet::new());
        let disposed = Arc::new(AtomicBool::new(false));

        let mut worker_task = None;
        let mut startup_failure = Vec::new();

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                worker_task = Some(rt.spawn(worker::run(runtime, command_rx, event_tx)));
                rt.spawn(pump(
                    name.clone(),
                    event_rx,
                    Arc::clone(&state),
                    Arc::clone(&listeners),
                    attached_rx,
                    Arc::clone(&disposed),
                    stopped_tx,
                ));
                let _ = command_tx.send(WorkerCommand::Init { options });
                info!("Spawned session {} ('{}') in {}", id, name, cwd.display());
            }
            Err(e) => {
                let message = PoolError::SessionSpawn(e.to_string()).to_string();
                error!("Session '{}' could not start: {}", name, message);
                state.write().status = SessionStatus::Error;
                startup_failure.push(SessionEvent::StatusChanged {
                    from: SessionStatus::Starting,
                    to: SessionStatus::Error,
                });
                startup_failure.push(SessionEvent::Error { message });
                let _ = stopped_tx.send(true);
            }
        }

        Self {
            id,
            name,
            cwd,
            started_at: now,
            state,
            commands: command_tx,
            listeners,
            attached: attached_tx,
            stopped: stopped_rx,
            disposed,
            worker: Mutex::new(worker_task),
            startup_failure: Mutex::new(startup_failure),
            shutdown_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn to_session(&self) -> Session {
        let live = self.state.read();
        Session {
            id: self.id.clone(),
            name: self.name.clone(),
            cwd: self.cwd.clone(),
            started_at: self.started_at,
            status: live.status,
            last_activity_at: live.last_activity_at,
            token_count: live.token_count,
        }
    }

    /// Register an event handler.
    ///
    /// Events produced before the first handler was registered are delivered
    /// to it first, in order.
    pub fn on_event(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let handler: Arc<EventHandler> = Arc::new(handler);
        let subscription = self.listeners.subscribe(Arc::clone(&handler));

        let replay = std::mem::take(&mut *self.startup_failure.lock());
        for event in &replay {
            isolate("session event", || handler(event));
        }

        self.attached.send_replace(true);
        subscription
    }

    pub fn send_prompt(&self, text: impl Into<String>) {
        self.send(WorkerCommand::Prompt { text: text.into() });
    }

    pub fn send_approval(&self) {
        self.send(WorkerCommand::Approve);
    }

    pub fn send_rejection(&self, reason: Option<String>) {
        self.send(WorkerCommand::Reject { reason });
    }

    pub fn send_abort(&self) {
        self.send(WorkerCommand::Abort);
    }

    fn send(&self, command: WorkerCommand) {
        if self.is_disposed() {
            debug!("Session {} is disposed; dropping {:?}", self.id, command);
            return;
        }
        if self.commands.send(command).is_err() {
            debug!("Session {} worker is gone", self.id);
        }
    }

    /// Stop the worker without disposing, as when the agent exits by itself
    #[cfg(test)]
    pub(crate) fn stop_worker(&self) {
        self.send(WorkerCommand::Shutdown);
    }

    /// Ask the worker to stop, then terminate it if it has not acknowledged
    /// within the shutdown timeout. Later calls return immediately.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.commands.send(WorkerCommand::Shutdown);

        let mut stopped = self.stopped.clone();
        let acknowledged = tokio::time::timeout(self.shutdown_timeout, stopped.wait_for(|done| *done))
            .await
            .is_ok();

        if acknowledged {
            debug!("Session {} shut down", self.id);
        } else {
            warn!(
                "Session {} did not acknowledge shutdown within {:?}; terminating worker",
                self.id, self.shutdown_timeout
            );
            if let Some(worker) = self.worker.lock().take() {
                worker.abort();
            }
        }
    }
}

/// Apply worker events to the live state and fan them out.
///
/// Until the first handler attaches, translated events are held back and then
/// delivered in order.
async fn pump(
    name: String,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    state: Arc<RwLock<LiveState>>,
    listeners: Arc<ListenerSet<EventHandler>>,
    mut attached: watch::Receiver<bool>,
    disposed: Arc<AtomicBool>,
    stopped: watch::Sender<bool>,
) {
    let deliver = |event: &SessionEvent| listeners.notify("session event", |handler| handler(event));
    let mut backlog: Vec<SessionEvent> = Vec::new();
    let mut is_attached = *attached.borrow();
    let mut acknowledged = false;

    loop {
        tokio::select! {
            biased;
            _ = attached.changed(), if !is_attached => {
                is_attached = true;
                for event in backlog.drain(..) {
                    deliver(&event);
                }
            }
            next = events.recv() => {
                let Some(raw) = next else { break };
                let Some(event) = translate(&name, &state, raw) else { continue };

                let done = event == SessionEvent::ShutdownComplete;
                if done {
                    let _ = stopped.send(true);
                }
                if is_attached {
                    deliver(&event);
                } else {
                    backlog.push(event);
                }
                if done {
                    acknowledged = true;
                    break;
                }
            }
        }
    }

    if !acknowledged {
        let tail = if disposed.load(Ordering::SeqCst) {
            vec![
                WorkerEvent::StatusChanged {
                    status: SessionStatus::Shutdown,
                },
                WorkerEvent::ShutdownComplete,
            ]
        } else {
            error!("Session '{}' worker exited unexpectedly", name);
            vec![
                WorkerEvent::StatusChanged {
                    status: SessionStatus::Error,
                },
                WorkerEvent::Error {
                    message: "worker exited unexpectedly".to_string(),
                },
            ]
        };
        backlog.extend(tail.into_iter().filter_map(|raw| translate(&name, &state, raw)));
        let _ = stopped.send(true);
    }

    if !is_attached && !backlog.is_empty() && attached.wait_for(|a| *a).await.is_err() {
        return;
    }
    for event in backlog.drain(..) {
        deliver(&event);
    }
}

fn translate(name: &str, state: &RwLock<LiveState>, event: WorkerEvent) -> Option<SessionEvent> {
    match event {
        WorkerEvent::StatusChanged { status } => {
            let mut live = state.write();
            let from = live.status;
            if from == status {
                return None;
            }
            if !from.can_transition_to(status) {
                warn!("Session '{}' rejected transition {} -> {}", name, from, status);
                return None;
            }
            live.status = status;
            Some(SessionEvent::StatusChanged { from, to: status })
        }
        WorkerEvent::Activity { at, tokens } => {
            let mut live = state.write();
            if at > live.last_activity_at {
                live.last_activity_at = at;
            }
            live.token_count = live.token_count.saturating_add(tokens);
            Some(SessionEvent::Activity {
                last_activity_at: live.last_activity_at,
                token_count: live.token_count,
            })
        }
        WorkerEvent::ApprovalNeeded { tool_call } => Some(SessionEvent::ApprovalNeeded { tool_call }),
        WorkerEvent::Error { message } => Some(SessionEvent::Error { message }),
        WorkerEvent::ShutdownComplete => {
            state.write().status = SessionStatus::Shutdown;
            Some(SessionEvent::ShutdownComplete)
        }
    }
}
