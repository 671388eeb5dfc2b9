use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::bridge::WorkflowBridge;
use super::definition::{self, WorkflowContext, WorkflowDefinition, WorkflowStep};
use super::graph;
use super::handle::{ProgressEvent, WorkflowHandle, WorkflowRun, WorkflowStatus};
use super::WorkflowError;

/// Finished runs kept for `runs()`/`get_run()` before the oldest are dropped
pub const DEFAULT_RUN_RETENTION: usize = 100;

/// Discovers workflow definitions and runs them wave by wave through a bridge
pub struct WorkflowEngine {
    bridge: Arc<dyn WorkflowBridge>,
    workflows_dir: Option<PathBuf>,
    definitions: RwLock<BTreeMap<String, WorkflowDefinition>>,
    // Start order. Runs still in flight are never dropped.
    runs: RwLock<Vec<WorkflowHandle>>,
    run_retention: usize,
}

impl WorkflowEngine {
    pub fn new(bridge: Arc<dyn WorkflowBridge>) -> Self {
        Self {
            bridge,
            workflows_dir: None,
            definitions: RwLock::new(BTreeMap::new()),
            runs: RwLock::new(Vec::new()),
            run_retention: DEFAULT_RUN_RETENTION,
        }
    }

    /// How many finished runs to remember
    pub fn with_run_retention(mut self, finished_runs: usize) -> Self {
        self.run_retention = finished_runs;
        self
    }

    pub fn with_workflows_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workflows_dir = Some(dir.into());
        self
    }

    pub fn workflows_dir(&self) -> Option<&Path> {
        self.workflows_dir.as_deref()
    }

    /// Reload definitions from the workflows directory, replacing the
    /// previous set. Returns how many were found.
    pub fn discover(&self) -> Result<usize, WorkflowError> {
        let Some(dir) = &self.workflows_dir else {
            return Ok(self.definitions.read().len());
        };
        let found = definition::discover(dir)?;
        let count = found.len();
        *self.definitions.write() = found;
        info!("Discovered {} workflow(s) in {}", count, dir.display());
        Ok(count)
    }

    /// Add or replace a definition without touching disk
    pub fn register(&self, definition: WorkflowDefinition) {
        self.definitions
            .write()
            .insert(definition.id.clone(), definition);
    }

    pub fn list(&self) -> Vec<WorkflowDefinition> {
        self.definitions.read().values().cloned().collect()
    }

    pub fn get(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.definitions.read().get(workflow_id).cloned()
    }

    pub fn run(
        &self,
        workflow_id: &str,
        context: WorkflowContext,
    ) -> Result<WorkflowHandle, WorkflowError> {
        let definition = self
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(workflow_id.to_string()))?;
        self.execute(definition, context)
    }

    /// Validate `definition` and start running it in the background.
    ///
    /// Validation errors come back synchronously; step failures only show up
    /// on the returned handle. Outside a tokio runtime nothing is started and
    /// [`WorkflowError::Scheduler`] is returned.
    pub fn execute(
        &self,
        definition: WorkflowDefinition,
        mut context: WorkflowContext,
    ) -> Result<WorkflowHandle, WorkflowError> {
        let waves = graph::plan(&definition)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WorkflowError::Scheduler(e.to_string()))?;
        context.workflow_id = Some(definition.id.clone());

        let handle = WorkflowHandle::new(&definition);
        self.remember(handle.clone());

        info!(
            "Starting workflow '{}' as run {} ({} step(s), {} wave(s))",
            definition.id,
            handle.id(),
            definition.steps.len(),
            waves.len()
        );

        runtime.spawn(schedule(
            Arc::clone(&self.bridge),
            definition,
            context,
            waves,
            handle.clone(),
        ));

        Ok(handle)
    }

    /// Snapshots of remembered runs, oldest first
    pub fn runs(&self) -> Vec<WorkflowRun> {
        self.runs.read().iter().map(WorkflowHandle::snapshot).collect()
    }

    pub fn get_run(&self, run_id: &str) -> Option<WorkflowHandle> {
        self.runs
            .read()
            .iter()
            .find(|handle| handle.id() == run_id)
            .cloned()
    }

    fn remember(&self, handle: WorkflowHandle) {
        let mut runs = self.runs.write();
        runs.push(handle);

        let finished = runs.iter().filter(|run| run.status().is_terminal()).count();
        let mut excess = finished.saturating_sub(self.run_retention);
        if excess > 0 {
            debug!("Forgetting {} finished run(s)", excess);
            runs.retain(|run| {
                if excess > 0 && run.status().is_terminal() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

async fn schedule(
    bridge: Arc<dyn WorkflowBridge>,
    definition: WorkflowDefinition,
    context: WorkflowContext,
    waves: Vec<Vec<usize>>,
    handle: WorkflowHandle,
) {
    handle.mark_running();

    for (number, wave) in waves.iter().enumerate() {
        if handle.is_aborted() {
            info!("Run {} aborted before wave {}", handle.id(), number + 1);
            return;
        }

        debug!("Run {} wave {}: {:?}", handle.id(), number + 1, wave);
        let outcomes = join_all(
            wave.iter()
                .map(|&index| run_step(bridge.as_ref(), &definition.steps[index], &context, &handle)),
        )
        .await;

        // The first failure in declaration order is the one reported
        if let Some(failure) = outcomes.into_iter().find_map(Result::err) {
            let (step_id, error) = match failure {
                WorkflowError::Execution { step_id, message } => (step_id, message),
                other => (String::new(), other.to_string()),
            };
            warn!("Run {} failed at step '{}': {}", handle.id(), step_id, error);
            handle.finish(
                WorkflowStatus::Failed,
                ProgressEvent::WorkflowFailed { step_id, error },
            );
            return;
        }
    }

    if handle.finish(WorkflowStatus::Completed, ProgressEvent::WorkflowCompleted) {
        info!("Run {} of '{}' completed", handle.id(), definition.id);
    }
}

async fn run_step(
    bridge: &dyn WorkflowBridge,
    step: &WorkflowStep,
    context: &WorkflowContext,
    handle: &WorkflowHandle,
) -> Result<(), WorkflowError> {
    handle.step_started(&step.id);
    match bridge.execute_step(step, context).await {
        Ok(()) => {
            handle.step_completed(&step.id);
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            handle.step_failed(&step.id, &message);
            Err(WorkflowError::Execution {
                step_id: step.id.clone(),
                message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{BridgeError, StepState};
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Records step starts; fails the listed steps; optionally parks the
    /// first wave until released.
    #[derive(Default)]
    struct RecordingBridge {
        started: Mutex<Vec<String>>,
        failing: HashSet<String>,
        gate: Option<Arc<Notify>>,
    }

    impl RecordingBridge {
        fn failing(steps: &[&str]) -> Self {
            Self {
                failing: steps.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().clone()
        }
    }

    impl WorkflowBridge for RecordingBridge {
        fn execute_step<'a>(
            &'a self,
            step: &'a WorkflowStep,
            context: &'a WorkflowContext,
        ) -> BoxFuture<'a, Result<(), BridgeError>> {
            Box::pin(async move {
                self.started.lock().push(step.id.clone());
                assert_eq!(context.workflow_id.as_deref(), Some("wf"));
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                if self.failing.contains(&step.id) {
                    return Err(BridgeError::Step(format!("{} exploded", step.id)));
                }
                Ok(())
            })
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "Workflow".to_string(),
            description: None,
            steps,
        }
    }

    fn linear() -> WorkflowDefinition {
        workflow(vec![
            WorkflowStep::new("a", "first"),
            WorkflowStep::new("b", "second").after(&["a"]),
            WorkflowStep::new("c", "third").after(&["b"]),
        ])
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_order() {
        let bridge = Arc::new(RecordingBridge::default());
        let engine = WorkflowEngine::new(bridge.clone());

        let handle = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        assert_eq!(handle.wait().await, WorkflowStatus::Completed);
        assert_eq!(bridge.started(), vec!["a", "b", "c"]);
        assert_eq!(handle.history().last(), Some(&ProgressEvent::WorkflowCompleted));
    }

    #[tokio::test]
    async fn test_diamond_runs_middle_steps_in_one_wave() {
        let bridge = Arc::new(RecordingBridge::default());
        let engine = WorkflowEngine::new(bridge.clone());
        let diamond = workflow(vec![
            WorkflowStep::new("a", "p"),
            WorkflowStep::new("b", "p").after(&["a"]),
            WorkflowStep::new("c", "p").after(&["a"]),
            WorkflowStep::new("d", "p").after(&["b", "c"]),
        ]);

        let handle = engine.execute(diamond, WorkflowContext::new("/tmp")).unwrap();
        assert_eq!(handle.wait().await, WorkflowStatus::Completed);

        let started = bridge.started();
        assert_eq!(started.first().map(String::as_str), Some("a"));
        assert_eq!(started.last().map(String::as_str), Some("d"));

        // b and c both start before either completes
        let history = handle.history();
        let position = |event: &ProgressEvent| history.iter().position(|e| e == event).unwrap();
        let c_started = position(&ProgressEvent::StepStarted { step_id: "c".to_string() });
        let b_completed = position(&ProgressEvent::StepCompleted { step_id: "b".to_string() });
        assert!(c_started < b_completed);
    }

    #[tokio::test]
    async fn test_failure_stops_later_waves() {
        let bridge = Arc::new(RecordingBridge::failing(&["b"]));
        let engine = WorkflowEngine::new(bridge.clone());

        let handle = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        assert_eq!(handle.wait().await, WorkflowStatus::Failed);
        assert_eq!(bridge.started(), vec!["a", "b"]);

        let steps = handle.step_statuses();
        assert_eq!(steps["a"].status, StepState::Completed);
        assert_eq!(steps["b"].status, StepState::Failed);
        assert_eq!(steps["b"].error.as_deref(), Some("b exploded"));
        assert_eq!(steps["c"].status, StepState::Pending);

        assert_eq!(
            handle.history().last(),
            Some(&ProgressEvent::WorkflowFailed {
                step_id: "b".to_string(),
                error: "b exploded".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_progress_replays_for_late_subscriber() {
        let engine = WorkflowEngine::new(Arc::new(RecordingBridge::default()));
        let handle = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        handle.wait().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = handle.on_progress(move |event| sink.lock().push(event.clone()));

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], ProgressEvent::StepStarted { step_id: "a".to_string() });
        assert_eq!(seen[6], ProgressEvent::WorkflowCompleted);
    }

    #[tokio::test]
    async fn test_abort_prevents_next_wave() {
        let gate = Arc::new(Notify::new());
        let bridge = Arc::new(RecordingBridge {
            gate: Some(gate.clone()),
            ..RecordingBridge::default()
        });
        let engine = WorkflowEngine::new(bridge.clone());

        let handle = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        while bridge.started().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        handle.abort();
        assert_eq!(handle.status(), WorkflowStatus::Aborted);
        gate.notify_one();

        assert_eq!(handle.wait().await, WorkflowStatus::Aborted);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(bridge.started(), vec!["a"]);
        assert_eq!(handle.step_status("a").unwrap().status, StepState::Completed);
    }

    #[tokio::test]
    async fn test_invalid_definition_rejected_synchronously() {
        let engine = WorkflowEngine::new(Arc::new(RecordingBridge::default()));
        let err = engine
            .execute(workflow(vec![]), WorkflowContext::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Validation { .. }));
        assert!(engine.runs().is_empty());
    }

    #[tokio::test]
    async fn test_run_by_id() {
        let engine = WorkflowEngine::new(Arc::new(RecordingBridge::default()));
        assert!(matches!(
            engine.run("wf", WorkflowContext::new("/tmp")),
            Err(WorkflowError::WorkflowNotFound(id)) if id == "wf"
        ));

        engine.register(linear());
        let handle = engine.run("wf", WorkflowContext::new("/tmp")).unwrap();
        handle.wait().await;

        assert_eq!(engine.runs().len(), 1);
        assert_eq!(
            engine.get_run(handle.id()).map(|h| h.status()),
            Some(WorkflowStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_discover_replaces_definitions() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("wf.json"),
            r#"{ "name": "From disk", "steps": [{ "id": "a", "prompt": "p" }] }"#,
        )
        .unwrap();

        let engine = WorkflowEngine::new(Arc::new(RecordingBridge::default()))
            .with_workflows_dir(temp.path());
        engine.register(linear());
        assert_eq!(engine.discover().unwrap(), 1);
        assert_eq!(engine.get("wf").map(|d| d.name), Some("From disk".to_string()));
    }

    #[tokio::test]
    async fn test_finished_runs_beyond_retention_are_forgotten() {
        let engine =
            WorkflowEngine::new(Arc::new(RecordingBridge::default())).with_run_retention(2);

        let mut ids = Vec::new();
        for _ in 0..4 {
            let handle = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
            handle.wait().await;
            ids.push(handle.id().to_string());
        }
        // Pruning happens when a run starts, so the newest start saw 3 finished
        let kept: Vec<String> = engine.runs().into_iter().map(|run| run.id).collect();
        assert_eq!(kept, ids[1..].to_vec());
        assert!(engine.get_run(&ids[0]).is_none());

        engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap().wait().await;
        assert_eq!(engine.runs().len(), 3);
        assert!(engine.get_run(&ids[1]).is_none());
    }

    #[tokio::test]
    async fn test_running_runs_survive_pruning() {
        let gate = Arc::new(Notify::new());
        let bridge = Arc::new(RecordingBridge {
            gate: Some(gate.clone()),
            ..RecordingBridge::default()
        });
        let engine = WorkflowEngine::new(bridge).with_run_retention(0);

        let parked = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        let second = engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        assert_eq!(engine.runs().len(), 2);

        parked.abort();
        second.abort();
        engine.execute(linear(), WorkflowContext::new("/tmp")).unwrap();
        let kept: Vec<String> = engine.runs().into_iter().map(|run| run.id).collect();
        assert_eq!(kept.len(), 1);
        assert!(engine.get_run(parked.id()).is_none());
        gate.notify_waiters();
    }

    #[test]
    fn test_execute_without_runtime_is_an_error() {
        let engine = WorkflowEngine::new(Arc::new(RecordingBridge::default()));
        let err = engine
            .execute(linear(), WorkflowContext::new("/tmp"))
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Scheduler(_)));
        assert!(engine.runs().is_empty());
    }
}
