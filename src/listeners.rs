use foldhash::fast::FixedState;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Zero-argument change callback registered through `subscribe`
pub(crate) type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Identity of one listener registration
///
/// Ids are never reused within a store, so a disposer that runs late cannot
/// remove somebody else's registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ListenerId(u64);

/// Set of registered notifiers, keyed by registration identity
pub(crate) struct Listeners {
    entries: IndexMap<ListenerId, Notifier, FixedState>,
    next_id: u64,
}

impl Listeners {
    pub(crate) fn new() -> Self {
        Self {
            entries: IndexMap::default(),
            next_id: 0,
        }
    }

    pub(crate) fn insert(&mut self, notifier: Notifier) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, notifier);
        id
    }

    /// Remove a registration; false if it was already removed
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        self.entries.swap_remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: ListenerId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Everyone registered at this instant, for notification outside the lock
    pub(crate) fn snapshot(&self) -> Vec<(ListenerId, Notifier)> {
        self.entries
            .iter()
            .map(|(id, notifier)| (*id, notifier.clone()))
            .collect()
    }
}

/// Disposer returned by `subscribe`
///
/// Disposing removes the listener and may release the store's upstream
/// subscription. Disposal is idempotent, and dropping the handle disposes it.
///
/// ```ignore
/// let unsubscribe = store.subscribe(|| println!("changed"));
/// unsubscribe.dispose();
/// unsubscribe.dispose();  // No-op
/// ```
#[must_use = "dropping the handle unsubscribes the listener"]
pub struct Unsubscribe {
    dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    pub(crate) fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// Remove the listener; later calls do nothing
    pub fn dispose(&self) {
        let dispose = self.dispose.lock().take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }

    /// True once [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.dispose.lock().is_none()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.get_mut().take() {
            dispose();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ids_are_not_reused() {
        let mut listeners = Listeners::new();
        let first = listeners.insert(Arc::new(|| {}));
        assert!(listeners.remove(first));
        let second = listeners.insert(Arc::new(|| {}));

        assert_ne!(first, second);
        assert!(!listeners.remove(first));
        assert!(listeners.contains(second));
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn same_closure_registers_twice() {
        let mut listeners = Listeners::new();
        let notifier: Notifier = Arc::new(|| {});
        listeners.insert(notifier.clone());
        listeners.insert(notifier);
        assert_eq!(listeners.snapshot().len(), 2);
    }

    #[test]
    fn unsubscribe_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let handle = Unsubscribe::new(move || {
            runs_clone.fetch_add(1, Ordering::Relaxed);
        });

        handle.dispose();
        handle.dispose();
        assert!(handle.is_disposed());
        drop(handle);
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }
}
