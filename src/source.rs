//! Push-based source contract
//!
//! A [`Source`] delivers a sequence of values, possibly ending in an error, to
//! every [`Observer`] subscribed to it. Subscribing returns a [`Subscription`]
//! that tears the registration down when unsubscribed or dropped.
//!
//! Sources deliver serially and call observers synchronously, possibly from
//! inside [`Source::subscribe`] itself (replaying sources do that). Observers
//! must therefore tolerate being called before `subscribe` has returned.

use crate::share::ShareReplay;
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::sync::Arc;

/// Receiver of a source's emissions
pub trait Observer<T, E>: Send + Sync {
    /// Called for every emitted value
    fn on_next(&self, value: T);

    /// Called once when the source fails; nothing follows an error
    fn on_error(&self, error: E);
}

/// Observer assembled from two closures (see [`observer()`])
pub struct FnObserver<N, F> {
    on_next: N,
    on_error: F,
}

impl<T, E, N, F> Observer<T, E> for FnObserver<N, F>
where
    N: Fn(T) + Send + Sync,
    F: Fn(E) + Send + Sync,
{
    fn on_next(&self, value: T) {
        (self.on_next)(value)
    }

    fn on_error(&self, error: E) {
        (self.on_error)(error)
    }
}

/// Build a shareable observer from a value callback and an error callback
///
/// # Example
/// ```ignore
/// let seen = Arc::new(AtomicUsize::new(0));
/// let seen_clone = seen.clone();
/// let _sub = subject.subscribe(observer(
///     move |v: u32| { seen_clone.store(v as usize, Ordering::Relaxed); },
///     |_err: String| {},
/// ));
/// ```
pub fn observer<T, E, N, F>(on_next: N, on_error: F) -> Arc<dyn Observer<T, E>>
where
    T: 'static,
    E: 'static,
    N: Fn(T) + Send + Sync + 'static,
    F: Fn(E) + Send + Sync + 'static,
{
    Arc::new(FnObserver { on_next, on_error })
}

/// A push-based producer that can be subscribed to repeatedly
pub trait Source: Send + Sync + 'static {
    /// Emitted value type
    type Item: Clone + Send + 'static;
    /// Terminal error type
    type Error: Clone + Send + 'static;

    /// Register `observer` and return the handle that unregisters it
    fn subscribe(&self, observer: Arc<dyn Observer<Self::Item, Self::Error>>) -> Subscription;

    /// Multicast this source through a reference-counted replay view
    fn share_replay(self) -> ShareReplay<Self>
    where
        Self: Sized,
    {
        ShareReplay::new(self)
    }
}

impl<S: Source> Source for Arc<S> {
    type Item = S::Item;
    type Error = S::Error;

    fn subscribe(&self, observer: Arc<dyn Observer<Self::Item, Self::Error>>) -> Subscription {
        (**self).subscribe(observer)
    }
}

/// Handle to a live registration on a [`Source`]
///
/// The teardown runs at most once: on the first [`unsubscribe()`](Self::unsubscribe)
/// or when the handle is dropped, whichever comes first.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    teardown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Wrap a teardown closure
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            teardown: Mutex::new(Some(Box::new(teardown))),
        }
    }

    /// A subscription with nothing to tear down
    pub fn empty() -> Self {
        Self {
            teardown: Mutex::new(None),
        }
    }

    /// Run the teardown if it has not run yet
    pub fn unsubscribe(&self) {
        let teardown = self.teardown.lock().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    /// True once the teardown has run (or if there never was one)
    pub fn is_closed(&self) -> bool {
        self.teardown.lock().is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(teardown) = self.teardown.get_mut().take() {
            teardown();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Key of an entry in an [`ObserverSet`]
///
/// The serial guards against slab slot reuse: a key whose entry was cleared
/// never matches the observer that later took its slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ObserverKey {
    index: usize,
    serial: u64,
}

struct ObserverEntry<T, E> {
    serial: u64,
    observer: Arc<dyn Observer<T, E>>,
}

/// Registry of observers used by the multicasting sources
pub(crate) struct ObserverSet<T, E> {
    entries: Slab<ObserverEntry<T, E>>,
    next_serial: u64,
}

impl<T, E> ObserverSet<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Slab::new(),
            next_serial: 0,
        }
    }

    pub(crate) fn insert(&mut self, observer: Arc<dyn Observer<T, E>>) -> ObserverKey {
        let serial = self.next_serial;
        self.next_serial += 1;
        let index = self.entries.insert(ObserverEntry { serial, observer });
        ObserverKey { index, serial }
    }

    /// Remove the entry for `key`; false if it was already gone
    pub(crate) fn remove(&mut self, key: ObserverKey) -> bool {
        match self.entries.get(key.index) {
            Some(entry) if entry.serial == key.serial => {
                self.entries.remove(key.index);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clone out the current observers so they can be called unlocked
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Observer<T, E>>> {
        self.entries
            .iter()
            .map(|(_, entry)| entry.observer.clone())
            .collect()
    }

    /// Remove every observer, returning them
    pub(crate) fn drain(&mut self) -> Vec<Arc<dyn Observer<T, E>>> {
        self.entries.drain().map(|entry| entry.observer).collect()
    }
}
