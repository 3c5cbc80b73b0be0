//! Observer registry: a dynamic set of callbacks.
//!
//! Handlers are added and removed by [`HandlerId`]. Notification runs over a
//! snapshot of the current set, so handlers may add or remove handlers while
//! being notified. A panicking handler is logged and the remaining handlers
//! still run.

use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`ObserverRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct ObserverRegistry<T> {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Handler<T>)>>,
}

impl<T> ObserverRegistry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler.
    pub fn add<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns `false` if it was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    /// Call every registered handler with `value`.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn notify(&self, value: &T) -> usize {
        let snapshot: Vec<(HandlerId, Handler<T>)> = self.handlers.read().clone();
        let mut completed = 0;
        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(value))) {
                Ok(()) => completed += 1,
                Err(_) => log::error!("Observer handler {id:?} panicked; continuing"),
            }
        }
        completed
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl<T> Default for ObserverRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
