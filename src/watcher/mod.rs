use std::path::Path;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// Re-runs a callback when workflow definitions in a directory change
pub struct WorkflowWatcher {
    #[allow(dead_code)] // Must keep watcher alive to maintain file watching
    watcher: RecommendedWatcher,
}

impl WorkflowWatcher {
    /// Fires `on_change` once a burst of edits has been quiet for 500ms
    pub fn new(
        workflows_dir: &Path,
        on_change: impl Fn() + Send + 'static,
    ) -> Result<Self, notify::Error> {
        Self::with_debounce(workflows_dir, DEBOUNCE, on_change)
    }

    pub fn with_debounce(
        workflows_dir: &Path,
        debounce: Duration,
        on_change: impl Fn() + Send + 'static,
    ) -> Result<Self, notify::Error> {
        let (tx, rx) = channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, _>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })?;

        std::fs::create_dir_all(workflows_dir)?;
        watcher.watch(workflows_dir, RecursiveMode::NonRecursive)?;
        info!("Watching {} for workflow changes", workflows_dir.display());

        std::thread::spawn(move || {
            while let Ok(event) = rx.recv() {
                if !Self::is_relevant(&event) {
                    continue;
                }
                debug!("Workflow change: {:?}", event.paths);
                let open = Self::settle(&rx, debounce);
                on_change();
                if !open {
                    break;
                }
            }
        });

        Ok(Self { watcher })
    }

    /// Absorb events until no relevant one arrives for `debounce`.
    /// Returns false once the sender is gone.
    fn settle(rx: &Receiver<Event>, debounce: Duration) -> bool {
        let mut deadline = Instant::now() + debounce;
        loop {
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(event) => {
                    if Self::is_relevant(&event) {
                        debug!("Workflow change debounced: {:?}", event.paths);
                        deadline = Instant::now() + debounce;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    fn is_relevant(event: &Event) -> bool {
        matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) && event.paths.iter().any(|path| Self::is_workflow_file(path))
    }

    fn is_workflow_file(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::ScriptedRuntime;
    use crate::session::SessionPool;
    use crate::workflow::{PoolBridge, WorkflowEngine};
    use notify::event::{CreateKind, ModifyKind};
    use std::path::PathBuf;
    use std::sync::Arc;

    #[test]
    fn test_only_json_changes_are_relevant() {
        let json = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/flows/release.json"));
        let swap = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/flows/.release.json.swp"));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/flows/release.json"));

        assert!(WorkflowWatcher::is_relevant(&json));
        assert!(!WorkflowWatcher::is_relevant(&swap));
        assert!(!WorkflowWatcher::is_relevant(&access));
    }

    fn change(path: &str) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_settle_waits_for_the_last_change() {
        let (tx, rx) = channel();
        let debounce = Duration::from_millis(200);
        let started = Instant::now();

        let writer = std::thread::spawn(move || {
            for _ in 0..3 {
                std::thread::sleep(Duration::from_millis(100));
                tx.send(change("/flows/release.json")).unwrap();
            }
            std::thread::sleep(Duration::from_secs(1));
            drop(tx);
        });

        assert!(WorkflowWatcher::settle(&rx, debounce));
        // Three writes 100ms apart, then one quiet window
        assert!(started.elapsed() >= Duration::from_millis(500));
        writer.join().unwrap();
    }

    #[test]
    fn test_settle_ignores_irrelevant_events_and_reports_disconnect() {
        let (tx, rx) = channel();
        tx.send(change("/flows/notes.txt")).unwrap();
        assert!(WorkflowWatcher::settle(&rx, Duration::from_millis(50)));

        tx.send(change("/flows/release.json")).unwrap();
        drop(tx);
        assert!(!WorkflowWatcher::settle(&rx, Duration::from_millis(50)));
    }

    #[test]
    fn test_watcher_fires_on_new_definition() {
        let temp = tempfile::TempDir::new().unwrap();
        let (tx, rx) = channel();
        let _watcher = WorkflowWatcher::new(temp.path(), move || {
            let _ = tx.send(());
        })
        .unwrap();

        std::fs::write(temp.path().join("new.json"), "{}").unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_definition_written_in_two_steps_is_discovered() {
        let temp = tempfile::TempDir::new().unwrap();
        let pool = SessionPool::new(ScriptedRuntime::new(), 1);
        let engine = Arc::new(
            WorkflowEngine::new(Arc::new(PoolBridge::new(pool))).with_workflows_dir(temp.path()),
        );
        let (tx, rx) = channel();
        let watched = Arc::clone(&engine);
        let _watcher = WorkflowWatcher::new(temp.path(), move || {
            let _ = watched.discover();
            let _ = tx.send(());
        })
        .unwrap();

        let path = temp.path().join("release.json");
        std::fs::write(&path, "").unwrap();
        std::thread::sleep(Duration::from_millis(150));
        let definition = r#"{ "name": "Release", "steps": [{ "id": "tag", "prompt": "tag it" }] }"#;
        std::fs::write(&path, definition).unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert_eq!(engine.get("release").map(|d| d.name), Some("Release".to_string()));
    }
}
