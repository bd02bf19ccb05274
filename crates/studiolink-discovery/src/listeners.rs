//! Synchronous callback lists.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned when a listener is added; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered list of callbacks.
///
/// Callbacks run on the thread that fires the event, after the list lock is
/// released, so a callback may add or remove listeners.
pub struct Listeners<T: ?Sized> {
    entries: RwLock<Vec<(ListenerId, Arc<T>)>>,
}

impl<T: ?Sized> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<T>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// The current listeners, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
