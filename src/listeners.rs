use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// A set of registered callbacks.
///
/// Delivery iterates over a snapshot taken under the read lock, so a callback
/// may subscribe or unsubscribe while a notification is in flight. A panicking
/// callback is logged and skipped; the remaining callbacks still run.
pub struct ListenerSet<T: ?Sized> {
    registry: Arc<Registry<T>>,
}

struct Registry<T: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Arc<T>)>>,
}

impl<T: ?Sized + Send + Sync + 'static> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                entries: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a listener. The returned subscription removes it again.
    pub fn subscribe(&self, listener: Arc<T>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.entries.write().push((id, listener));

        let registry = Arc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.entries.write().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.registry.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.registry.entries.write().clear();
    }

    /// Invoke `call` once per registered listener.
    pub fn notify(&self, label: &str, mut call: impl FnMut(&T)) {
        let snapshot: Vec<Arc<T>> = self
            .registry
            .entries
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            isolate(label, || call(&listener));
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one listener invocation, swallowing a panic.
pub(crate) fn isolate(label: &str, call: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(call)).is_err() {
        tracing::warn!("{} listener panicked; delivery continues", label);
    }
}

/// Handle returned by every `subscribe`/`on_event`/`on_progress` call.
///
/// Dropping it leaves the listener registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
