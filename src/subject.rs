use crate::source::{Observer, ObserverKey, ObserverSet, Source, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Hot multicast source driven by explicit `next`/`error` calls
///
/// Cloning a `Subject` yields another handle to the same stream, so one clone
/// can be handed to stores while another pushes values.
///
/// # Usage
/// ```ignore
/// let increments = Subject::<u32, String>::new();
/// let store = LiveStore::new(increments.clone());
///
/// increments.next(1);      // Delivered to every current observer
/// increments.error("boom".into());  // Terminates the stream
/// ```
///
/// A subject created with [`Subject::behavior`] remembers the latest value and
/// replays it to each new observer during `subscribe`.
pub struct Subject<T, E> {
    inner: Arc<SubjectInner<T, E>>,
}

struct SubjectInner<T, E> {
    state: Mutex<SubjectState<T, E>>,
}

struct SubjectState<T, E> {
    observers: ObserverSet<T, E>,
    /// Latest value, only tracked by behavior subjects
    latest: Option<T>,
    replays: bool,
    /// Set once `error` has been called
    terminated: Option<E>,
}

impl<T, E> Clone for Subject<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Default for Subject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Subject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a subject that only forwards values emitted after subscription
    pub fn new() -> Self {
        Self::with_state(None, false)
    }

    /// Create a subject that replays its latest value, starting with `initial`
    pub fn behavior(initial: T) -> Self {
        Self::with_state(Some(initial), true)
    }

    fn with_state(latest: Option<T>, replays: bool) -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                state: Mutex::new(SubjectState {
                    observers: ObserverSet::new(),
                    latest,
                    replays,
                    terminated: None,
                }),
            }),
        }
    }

    /// Deliver `value` to every observer registered right now
    ///
    /// Ignored once the subject has errored.
    pub fn next(&self, value: T) {
        let observers = {
            let mut state = self.inner.state.lock();
            if state.terminated.is_some() {
                return;
            }
            if state.replays {
                state.latest = Some(value.clone());
            }
            state.observers.snapshot()
        };

        tracing::trace!(observers = observers.len(), "subject emitting");
        for observer in observers {
            observer.on_next(value.clone());
        }
    }

    /// Terminate the stream with `error`
    ///
    /// Current observers receive the error and are dropped. Later subscribers
    /// receive the same error immediately.
    pub fn error(&self, error: E) {
        let observers = {
            let mut state = self.inner.state.lock();
            if state.terminated.is_some() {
                return;
            }
            state.terminated = Some(error.clone());
            state.latest = None;
            state.observers.drain()
        };

        for observer in observers {
            observer.on_error(error.clone());
        }
    }

    /// Number of currently registered observers
    pub fn observer_count(&self) -> usize {
        self.inner.state.lock().observers.len()
    }

    /// True once [`error`](Self::error) has been called
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().terminated.is_some()
    }
}

impl<T, E> SubjectInner<T, E> {
    fn remove(&self, key: ObserverKey) {
        self.state.lock().observers.remove(key);
    }
}

impl<T, E> Source for Subject<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Item = T;
    type Error = E;

    fn subscribe(&self, observer: Arc<dyn Observer<T, E>>) -> Subscription {
        let (key, replay) = {
            let mut state = self.inner.state.lock();
            if let Some(error) = state.terminated.clone() {
                drop(state);
                observer.on_error(error);
                return Subscription::empty();
            }
            let replay = state.latest.clone();
            (state.observers.insert(observer.clone()), replay)
        };

        if let Some(value) = replay {
            observer.on_next(value);
        }

        let inner: Weak<SubjectInner<T, E>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(key);
            }
        })
    }
}
