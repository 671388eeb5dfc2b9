use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use super::WorkflowDefinition;
use crate::listeners::{isolate, ListenerSet, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub status: StepState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepStatus {
    fn pending() -> Self {
        Self {
            status: StepState::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepStarted { step_id: String },
    StepCompleted { step_id: String },
    StepFailed { step_id: String, error: String },
    WorkflowCompleted,
    WorkflowFailed { step_id: String, error: String },
    WorkflowAborted,
}

/// Serializable snapshot of a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub steps: BTreeMap<String, StepStatus>,
}

type ProgressCallback = dyn Fn(&ProgressEvent) + Send + Sync;

struct RunState {
    id: String,
    workflow_id: String,
    status: watch::Sender<WorkflowStatus>,
    steps: RwLock<BTreeMap<String, StepStatus>>,
    aborted: AtomicBool,
    // Emission and replay hold this lock, so a late subscriber sees history
    // and live events without gaps or reordering.
    history: ReentrantMutex<RefCell<Vec<ProgressEvent>>>,
    listeners: ListenerSet<ProgressCallback>,
}

/// Live view of one workflow run
#[derive(Clone)]
pub struct WorkflowHandle {
    inner: Arc<RunState>,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("id", &self.inner.id)
            .field("workflow_id", &self.inner.workflow_id)
            .field("status", &self.status())
            .finish()
    }
}

impl WorkflowHandle {
    pub(crate) fn new(definition: &WorkflowDefinition) -> Self {
        let steps = definition
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepStatus::pending()))
            .collect();

        let (status, _) = watch::channel(WorkflowStatus::Pending);

        Self {
            inner: Arc::new(RunState {
                id: Uuid::new_v4().to_string(),
                workflow_id: definition.id.clone(),
                status,
                steps: RwLock::new(steps),
                aborted: AtomicBool::new(false),
                history: ReentrantMutex::new(RefCell::new(Vec::new())),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.inner.status.borrow()
    }

    pub fn step_statuses(&self) -> BTreeMap<String, StepStatus> {
        self.inner.steps.read().clone()
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.inner.steps.read().get(step_id).cloned()
    }

    pub fn snapshot(&self) -> WorkflowRun {
        WorkflowRun {
            id: self.inner.id.clone(),
            workflow_id: self.inner.workflow_id.clone(),
            status: self.status(),
            steps: self.step_statuses(),
        }
    }

    /// Progress events so far, in emission order
    pub fn history(&self) -> Vec<ProgressEvent> {
        self.inner.history.lock().borrow().clone()
    }

    /// Register a progress callback. Everything emitted before this call is
    /// replayed to it first.
    pub fn on_progress(
        &self,
        callback: impl Fn(&ProgressEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Arc<ProgressCallback> = Arc::new(callback);
        let guard = self.inner.history.lock();
        let replay = guard.borrow().clone();
        let subscription = self.inner.listeners.subscribe(Arc::clone(&callback));
        for event in &replay {
            isolate("workflow progress", || callback(event));
        }
        drop(guard);
        subscription
    }

    /// Stop launching waves. Steps already running finish on their own.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.finish(WorkflowStatus::Aborted, ProgressEvent::WorkflowAborted) {
            info!("Workflow run {} aborted", self.inner.id);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Resolves with the terminal status
    pub async fn wait(&self) -> WorkflowStatus {
        let mut status = self.inner.status.subscribe();
        let result = status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        // The terminal event is emitted under the history lock
        drop(self.inner.history.lock());
        result.unwrap_or_else(|_| self.status())
    }

    fn emit(&self, event: ProgressEvent) {
        let guard = self.inner.history.lock();
        guard.borrow_mut().push(event.clone());
        self.inner
            .listeners
            .notify("workflow progress", |callback| callback(&event));
    }

    pub(crate) fn mark_running(&self) {
        self.inner.status.send_if_modified(|status| {
            if *status == WorkflowStatus::Pending {
                *status = WorkflowStatus::Running;
                true
            } else {
                false
            }
        });
    }

    /// Move to a terminal status unless one was already reached
    pub(crate) fn finish(&self, status: WorkflowStatus, event: ProgressEvent) -> bool {
        let _guard = self.inner.history.lock();
        let changed = self.inner.status.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            self.emit(event);
        }
        changed
    }

    pub(crate) fn step_started(&self, step_id: &str) {
        if let Some(step) = self.inner.steps.write().get_mut(step_id) {
            step.status = StepState::Running;
            step.started_at = Some(Utc::now());
        }
        self.emit(ProgressEvent::StepStarted {
            step_id: step_id.to_string(),
        });
    }

    pub(crate) fn step_completed(&self, step_id: &str) {
        if let Some(step) = self.inner.steps.write().get_mut(step_id) {
            step.status = StepState::Completed;
            step.completed_at = Some(Utc::now());
        }
        self.emit(ProgressEvent::StepCompleted {
            step_id: step_id.to_string(),
        });
    }

    pub(crate) fn step_failed(&self, step_id: &str, error: &str) {
        if let Some(step) = self.inner.steps.write().get_mut(step_id) {
            step.status = StepState::Failed;
            step.completed_at = Some(Utc::now());
            step.error = Some(error.to_string());
        }
        self.emit(ProgressEvent::StepFailed {
            step_id: step_id.to_string(),
            error: error.to_string(),
        });
    }
}
