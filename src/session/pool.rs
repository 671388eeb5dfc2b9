use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use super::{Session, SessionEvent, SessionHandle, SessionOptions, SHUTDOWN_TIMEOUT};
use crate::listeners::{ListenerSet, Subscription};
use crate::notification::{NotificationAggregator, NotificationKind, SessionNotification};
use crate::runtime::AgentRuntime;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("session pool is at capacity ({current}/{max})")]
    AtCapacity { current: usize, max: usize },
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("failed to spawn session: {0}")]
    SessionSpawn(String),
}

/// Pool-level callbacks for the presentation layer. Every method defaults to a no-op.
pub trait SessionPoolListener: Send + Sync {
    fn on_session_added(&self, _session: &Session) {}
    fn on_session_removed(&self, _session_id: &str) {}
    fn on_session_updated(&self, _session: &Session) {}
    fn on_notification(&self, _notification: &SessionNotification) {}
}

struct PoolEntry {
    handle: Arc<SessionHandle>,
    subscription: Option<Subscription>,
}

struct PoolInner {
    runtime: Arc<dyn AgentRuntime>,
    max_concurrent: usize,
    shutdown_timeout: Duration,
    sessions: RwLock<HashMap<String, PoolEntry>>,
    notifications: RwLock<NotificationAggregator>,
    listeners: ListenerSet<dyn SessionPoolListener>,
}

/// Bounded set of live sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(runtime: Arc<dyn AgentRuntime>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                runtime,
                max_concurrent,
                shutdown_timeout: SHUTDOWN_TIMEOUT,
                sessions: RwLock::new(HashMap::new()),
                notifications: RwLock::new(NotificationAggregator::new()),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Must be called before the pool is shared
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.shutdown_timeout = timeout;
        }
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions that count against capacity
    pub fn live_count(&self) -> usize {
        Self::count_live(&self.inner.sessions.read())
    }

    fn count_live(sessions: &HashMap<String, PoolEntry>) -> usize {
        sessions
            .values()
            .filter(|entry| entry.handle.status().is_live())
            .count()
    }

    pub fn spawn(&self, options: SessionOptions) -> Result<Session, PoolError> {
        let handle = {
            let mut sessions = self.inner.sessions.write();
            let current = Self::count_live(&sessions);
            if current >= self.inner.max_concurrent {
                return Err(PoolError::AtCapacity {
                    current,
                    max: self.inner.max_concurrent,
                });
            }

            let handle = Arc::new(SessionHandle::spawn(
                Arc::clone(&self.inner.runtime),
                options,
                self.inner.shutdown_timeout,
            ));
            sessions.insert(
                handle.id().to_string(),
                PoolEntry {
                    handle: Arc::clone(&handle),
                    subscription: None,
                },
            );
            handle
        };

        let session = handle.to_session();
        self.inner
            .listeners
            .notify("pool", |listener| listener.on_session_added(&session));

        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let session_id = session.id.clone();
        let subscription = handle.on_event(move |event| {
            if let Some(inner) = pool.upgrade() {
                inner.handle_event(&session_id, event);
            }
        });

        match self.inner.sessions.write().get_mut(&session.id) {
            Some(entry) => entry.subscription = Some(subscription),
            None => subscription.unsubscribe(),
        }

        info!("Pool spawned session {} ('{}')", session.id, session.name);
        Ok(session)
    }

    pub async fn destroy(&self, session_id: &str) -> Result<(), PoolError> {
        let entry = self
            .inner
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;

        if let Some(subscription) = entry.subscription {
            subscription.unsubscribe();
        }
        entry.handle.dispose().await;
        self.inner.notifications.write().dismiss_all(session_id);
        self.inner
            .listeners
            .notify("pool", |listener| listener.on_session_removed(session_id));

        info!("Pool destroyed session {}", session_id);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|entry| entry.handle.to_session())
    }

    /// Snapshots, most recently active first
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|entry| entry.handle.to_session())
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        sessions
    }

    fn handle(&self, session_id: &str) -> Result<Arc<SessionHandle>, PoolError> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))
    }

    pub fn send_prompt(&self, session_id: &str, text: impl Into<String>) -> Result<(), PoolError> {
        self.handle(session_id)?.send_prompt(text);
        Ok(())
    }

    pub fn approve(&self, session_id: &str) -> Result<(), PoolError> {
        self.handle(session_id)?.send_approval();
        self.dismiss(session_id, NotificationKind::ApprovalNeeded);
        Ok(())
    }

    pub fn reject(&self, session_id: &str, reason: Option<String>) -> Result<(), PoolError> {
        self.handle(session_id)?.send_rejection(reason);
        self.dismiss(session_id, NotificationKind::ApprovalNeeded);
        Ok(())
    }

    pub fn abort(&self, session_id: &str) -> Result<(), PoolError> {
        self.handle(session_id)?.send_abort();
        Ok(())
    }

    pub fn get_notifications(&self) -> Vec<SessionNotification> {
        self.inner.notifications.read().get_notifications()
    }

    pub fn notification_count(&self) -> usize {
        self.inner.notifications.read().count()
    }

    pub fn approval_count(&self) -> usize {
        self.inner.notifications.read().approval_count()
    }

    pub fn dismiss(&self, session_id: &str, kind: NotificationKind) -> bool {
        self.inner.notifications.write().dismiss(session_id, kind)
    }

    pub fn dismiss_all(&self, session_id: &str) -> usize {
        self.inner.notifications.write().dismiss_all(session_id)
    }

    pub fn subscribe(&self, listener: Arc<dyn SessionPoolListener>) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// Dispose every session concurrently and forget all state
    pub async fn shutdown_all(&self) {
        let entries: Vec<PoolEntry> = self
            .inner
            .sessions
            .write()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let handles: Vec<Arc<SessionHandle>> = entries
            .into_iter()
            .map(|entry| {
                if let Some(subscription) = entry.subscription {
                    subscription.unsubscribe();
                }
                entry.handle
            })
            .collect();

        info!("Shutting down {} session(s)", handles.len());
        join_all(handles.iter().map(|handle| handle.dispose())).await;

        self.inner.notifications.write().clear();
        for handle in &handles {
            self.inner
                .listeners
                .notify("pool", |listener| listener.on_session_removed(handle.id()));
        }
    }
}

impl PoolInner {
    fn handle_event(&self, session_id: &str, event: &SessionEvent) {
        let Some(handle) = self
            .sessions
            .read()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.handle))
        else {
            debug!("Event for unknown session {}: {:?}", session_id, event);
            return;
        };

        let session = handle.to_session();
        self.listeners
            .notify("pool", |listener| listener.on_session_updated(&session));

        let notification = match event {
            SessionEvent::ApprovalNeeded { tool_call } => Some(
                SessionNotification::for_session(
                    &session,
                    NotificationKind::ApprovalNeeded,
                    format!("{} wants to run {}", session.name, tool_call.tool_name),
                )
                .with_tool_call(tool_call.clone()),
            ),
            SessionEvent::Error { message } => Some(SessionNotification::for_session(
                &session,
                NotificationKind::Error,
                message.clone(),
            )),
            SessionEvent::ShutdownComplete => Some(SessionNotification::for_session(
                &session,
                NotificationKind::Completed,
                format!("{} finished", session.name),
            )),
            SessionEvent::StatusChanged { .. } | SessionEvent::Activity { .. } => None,
        };

        if let Some(notification) = notification {
            self.notifications.write().add_notification(notification.clone());
            self.listeners
                .notify("pool", |listener| listener.on_notification(&notification));
        }

        if matches!(event, SessionEvent::ShutdownComplete) {
            if let Some(entry) = self.sessions.write().remove(session_id) {
                if let Some(subscription) = entry.subscription {
                    subscription.unsubscribe();
                }
            }
            self.listeners
                .notify("pool", |listener| listener.on_session_removed(session_id));
            info!("Session {} shut down on its own", session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{eventually, ScriptedRuntime, SCRIPTED_TOKENS};
    use crate::session::SessionStatus;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        added: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
        updates: Mutex<usize>,
        notifications: Mutex<Vec<NotificationKind>>,
    }

    impl SessionPoolListener for Recorder {
        fn on_session_added(&self, session: &Session) {
            self.added.lock().push(session.id.clone());
        }
        fn on_session_removed(&self, session_id: &str) {
            self.removed.lock().push(session_id.to_string());
        }
        fn on_session_updated(&self, _session: &Session) {
            *self.updates.lock() += 1;
        }
        fn on_notification(&self, notification: &SessionNotification) {
            self.notifications.lock().push(notification.kind);
        }
    }

    struct Exploding;

    impl SessionPoolListener for Exploding {
        fn on_session_added(&self, _session: &Session) {
            panic!("listener bug");
        }
    }

    fn options(name: &str) -> SessionOptions {
        SessionOptions::new("/tmp/work", name)
    }

    #[tokio::test]
    async fn test_spawn_beyond_capacity_fails() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 2);
        pool.spawn(options("a")).unwrap();
        pool.spawn(options("b")).unwrap();

        let err = pool.spawn(options("c")).unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity { current: 2, max: 2 }));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_frees_capacity_and_notifies() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 1);
        let recorder = Arc::new(Recorder::default());
        let _subscription = pool.subscribe(recorder.clone());

        let session = pool.spawn(options("only")).unwrap();
        assert_eq!(*recorder.added.lock(), vec![session.id.clone()]);

        pool.destroy(&session.id).await.unwrap();
        assert!(pool.is_empty());
        assert_eq!(*recorder.removed.lock(), vec![session.id.clone()]);

        pool.spawn(options("next")).unwrap();
    }

    #[tokio::test]
    async fn test_destroy_unknown_session() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 1);
        let err = pool.destroy("missing").await.unwrap_err();
        assert!(matches!(err, PoolError::SessionNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_list_orders_by_recent_activity() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 4);
        let first = pool.spawn(options("first")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = pool.spawn(options("second")).unwrap();
        assert_eq!(pool.list()[0].id, second.id);

        eventually(|| pool.get(&first.id).map(|s| s.status) == Some(SessionStatus::Idle)).await;
        pool.send_prompt(&first.id, "refactor").unwrap();
        eventually(|| pool.get(&first.id).map(|s| s.token_count) == Some(SCRIPTED_TOKENS)).await;

        let ids: Vec<String> = pool.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_error_event_becomes_notification() {
        let pool = SessionPool::new(ScriptedRuntime::failing(), 2);
        let recorder = Arc::new(Recorder::default());
        let _subscription = pool.subscribe(recorder.clone());

        let session = pool.spawn(options("broken")).unwrap();
        eventually(|| pool.notification_count() == 1).await;

        let notification = &pool.get_notifications()[0];
        assert_eq!(notification.kind, NotificationKind::Error);
        assert_eq!(notification.session_id, session.id);
        assert!(*recorder.updates.lock() >= 2);
        assert_eq!(*recorder.notifications.lock(), vec![NotificationKind::Error]);
    }

    #[tokio::test]
    async fn test_approval_notification_and_approve() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 2);
        let session = pool
            .spawn(options("gate").with_initial_prompt("needs-approval"))
            .unwrap();

        eventually(|| pool.approval_count() == 1).await;
        let notification = &pool.get_notifications()[0];
        assert_eq!(
            notification.tool_call.as_ref().map(|t| t.tool_name.as_str()),
            Some("bash")
        );

        pool.approve(&session.id).unwrap();
        assert_eq!(pool.approval_count(), 0);
        eventually(|| pool.get(&session.id).map(|s| s.status) == Some(SessionStatus::Working)).await;

        pool.abort(&session.id).unwrap();
        eventually(|| pool.get(&session.id).map(|s| s.status) == Some(SessionStatus::Idle)).await;
    }

    #[tokio::test]
    async fn test_worker_exit_completes_and_removes_session() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 1);
        let recorder = Arc::new(Recorder::default());
        let _subscription = pool.subscribe(recorder.clone());

        let session = pool.spawn(options("nightly")).unwrap();
        eventually(|| pool.get(&session.id).map(|s| s.status) == Some(SessionStatus::Idle)).await;

        pool.handle(&session.id).unwrap().stop_worker();
        eventually(|| !recorder.removed.lock().is_empty()).await;

        assert!(pool.is_empty());
        assert_eq!(*recorder.removed.lock(), vec![session.id.clone()]);
        assert_eq!(pool.notification_count(), 1);
        let notification = &pool.get_notifications()[0];
        assert_eq!(notification.kind, NotificationKind::Completed);
        assert_eq!(notification.session_id, session.id);
        assert_eq!(notification.message, "nightly finished");
        assert_eq!(*recorder.notifications.lock(), vec![NotificationKind::Completed]);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(recorder.removed.lock().len(), 1);
        pool.spawn(options("next")).unwrap();
    }

    #[tokio::test]
    async fn test_prompt_while_working_is_reported() {
        let runtime = ScriptedRuntime::slow(std::time::Duration::from_millis(200));
        let pool = SessionPool::new(runtime, 1);
        let session = pool.spawn(options("busy")).unwrap();
        eventually(|| pool.get(&session.id).map(|s| s.status) == Some(SessionStatus::Idle)).await;

        pool.send_prompt(&session.id, "refactor").unwrap();
        eventually(|| pool.get(&session.id).map(|s| s.status) == Some(SessionStatus::Working)).await;
        pool.send_prompt(&session.id, "and again").unwrap();

        eventually(|| pool.notification_count() == 1).await;
        assert_eq!(pool.get_notifications()[0].kind, NotificationKind::Error);
        assert_eq!(pool.get(&session.id).map(|s| s.token_count), Some(0));

        eventually(|| pool.get(&session.id).map(|s| s.token_count) == Some(SCRIPTED_TOKENS)).await;
        eventually(|| pool.get(&session.id).map(|s| s.status) == Some(SessionStatus::Idle)).await;
    }

    #[tokio::test]
    async fn test_destroy_clears_notifications() {
        let pool = SessionPool::new(ScriptedRuntime::failing(), 2);
        let session = pool.spawn(options("broken")).unwrap();
        eventually(|| pool.notification_count() == 1).await;

        pool.destroy(&session.id).await.unwrap();
        assert_eq!(pool.notification_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_disposes_everything() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 3);
        let recorder = Arc::new(Recorder::default());
        let _subscription = pool.subscribe(recorder.clone());
        for name in ["a", "b", "c"] {
            pool.spawn(options(name)).unwrap();
        }

        pool.shutdown_all().await;
        assert!(pool.is_empty());
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.notification_count(), 0);
        assert_eq!(recorder.removed.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_listener_is_isolated() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 2);
        let _bad = pool.subscribe(Arc::new(Exploding));
        let recorder = Arc::new(Recorder::default());
        let _good = pool.subscribe(recorder.clone());

        pool.spawn(options("a")).unwrap();
        assert_eq!(recorder.added.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_listener_hears_nothing() {
        let pool = SessionPool::new(ScriptedRuntime::new(), 2);
        let recorder = Arc::new(Recorder::default());
        pool.subscribe(recorder.clone()).unsubscribe();

        pool.spawn(options("a")).unwrap();
        assert!(recorder.added.lock().is_empty());
    }
}
