use super::{DEFAULT_LABEL, ExternalStore, StoreState, Upstream, notify_listeners};
use crate::error::SnapshotError;
use crate::listeners::{ListenerId, Listeners, Unsubscribe};
use crate::source::{Observer, Source};
use crate::suspender::Suspender;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::{Arc, Weak};

/// Store that keeps one live upstream subscription while there is demand
///
/// Demand is any registered listener, or a reader parked on an empty cache.
/// The upstream is subscribed on the first demand, every emission refreshes
/// the cache, and the subscription is released as soon as demand drops to
/// zero. A reader without listeners therefore holds the upstream only until
/// the first value arrives.
///
/// # Example
/// ```ignore
/// let counts = Subject::<u32, String>::new();
/// let store = LiveStore::new(counts.clone());
///
/// let pending = store.snapshot();          // Suspended: nothing emitted yet
/// let unsubscribe = store.subscribe(|| println!("count changed"));
///
/// counts.next(1);                          // Resumes readers, notifies listener
/// assert_eq!(store.snapshot().unwrap(), 1);
///
/// drop(unsubscribe);                       // Last listener: upstream released
/// ```
///
/// # Errors
/// A source error is cached and re-raised by every read. It is cleared when a
/// listener registers while no other listener is registered, which starts a
/// fresh subscription cycle.
pub struct LiveStore<S: Source> {
    inner: Arc<LiveInner<S>>,
}

struct LiveInner<S: Source> {
    source: S,
    label: Cow<'static, str>,
    suspender: Suspender,
    core: Mutex<LiveCore<S::Item, S::Error>>,
}

struct LiveCore<T, E> {
    state: StoreState<T, E>,
    listeners: Listeners,
    upstream: Upstream,
    next_ticket: u64,
}

impl<S: Source> LiveStore<S> {
    /// Wrap `source`; nothing is subscribed until the first read or listener
    pub fn new(source: S) -> Self {
        Self::with_label(source, DEFAULT_LABEL)
    }

    pub(crate) fn with_label(source: S, label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                source,
                label: label.into(),
                suspender: Suspender::new(),
                core: Mutex::new(LiveCore {
                    state: StoreState::Empty,
                    listeners: Listeners::new(),
                    upstream: Upstream::Inactive,
                    next_ticket: 0,
                }),
            }),
        }
    }

    /// Name used in log events
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// True while the upstream subscription is held
    pub fn is_subscribed(&self) -> bool {
        !self.inner.core.lock().upstream.is_inactive()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.core.lock().listeners.len()
    }

    /// Copy of the cached state
    pub fn state(&self) -> StoreState<S::Item, S::Error> {
        self.inner.core.lock().state.clone()
    }
}

impl<S: Source> LiveInner<S> {
    fn has_demand(&self, core: &LiveCore<S::Item, S::Error>) -> bool {
        !core.listeners.is_empty() || self.suspender.is_suspended()
    }

    /// Subscribe upstream if nothing is subscribed yet
    fn retain(self: &Arc<Self>) {
        let ticket = {
            let mut core = self.core.lock();
            if !core.upstream.is_inactive() || core.state.is_error() {
                return;
            }
            let ticket = core.next_ticket;
            core.next_ticket += 1;
            core.upstream = Upstream::Connecting(ticket);
            ticket
        };

        tracing::debug!(store = %self.label, "retaining source subscription");
        let observer: Arc<dyn Observer<S::Item, S::Error>> = Arc::new(LiveObserver {
            inner: Arc::downgrade(self),
            ticket,
        });
        // May deliver synchronously, which is why no lock is held here.
        let subscription = self.source.subscribe(observer);

        let abandoned = self.core.lock().upstream.settle(ticket, subscription);
        if let Some(subscription) = abandoned {
            cov_mark::hit!(live_connect_abandoned);
            tracing::debug!(store = %self.label, "demand ended while connecting");
            drop(subscription);
        }
    }

    /// Drop the upstream subscription if nobody needs it any more
    fn release(&self) {
        let subscription = {
            let mut core = self.core.lock();
            if self.has_demand(&core) {
                if core.listeners.is_empty() {
                    cov_mark::hit!(live_release_deferred_for_parked_read);
                }
                return;
            }
            core.upstream.clear()
        };

        if let Some(subscription) = subscription {
            tracing::debug!(store = %self.label, "releasing source subscription");
            drop(subscription);
        }
    }

    fn remove_listener(&self, id: ListenerId) {
        let removed = self.core.lock().listeners.remove(id);
        if removed {
            self.release();
        }
    }

    fn notify(&self, targets: Vec<(ListenerId, crate::listeners::Notifier)>) {
        notify_listeners(targets, |id| self.core.lock().listeners.contains(id));
    }

    fn on_next(&self, ticket: u64, value: S::Item) {
        let targets = {
            let mut core = self.core.lock();
            if core.upstream.ticket() != Some(ticket) {
                return;
            }
            core.state = StoreState::HasValue(value);
            core.listeners.snapshot()
        };

        tracing::trace!(store = %self.label, listeners = targets.len(), "value received");
        self.suspender.resume();
        if targets.is_empty() {
            // Only a snapshot reader wanted this value.
            self.release();
        } else {
            self.notify(targets);
        }
    }

    fn on_error(&self, ticket: u64, error: S::Error) {
        let (targets, subscription) = {
            let mut core = self.core.lock();
            if core.upstream.ticket() != Some(ticket) {
                return;
            }
            core.state = StoreState::HasError(error);
            // The source has terminated; its handle has nothing left to hold.
            (core.listeners.snapshot(), core.upstream.clear())
        };

        tracing::debug!(store = %self.label, listeners = targets.len(), "source error captured");
        drop(subscription);
        self.suspender.resume();
        self.notify(targets);
    }
}

struct LiveObserver<S: Source> {
    inner: Weak<LiveInner<S>>,
    ticket: u64,
}

impl<S: Source> Observer<S::Item, S::Error> for LiveObserver<S> {
    fn on_next(&self, value: S::Item) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_next(self.ticket, value);
        }
    }

    fn on_error(&self, error: S::Error) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_error(self.ticket, error);
        }
    }
}

impl<S: Source> ExternalStore for LiveStore<S> {
    type Item = S::Item;
    type Error = S::Error;

    fn snapshot(&self) -> Result<S::Item, SnapshotError<S::Error>> {
        let token = {
            let core = self.inner.core.lock();
            if let Some(cached) = core.state.read_cached() {
                return cached;
            }
            // Suspend before retaining so a parked read counts as demand
            // while the upstream is being connected.
            self.inner.suspender.suspend()
        };

        self.inner.retain();
        self.inner.core.lock().state.read_or_suspend(token)
    }

    fn subscribe<F>(&self, notifier: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = {
            let mut core = self.inner.core.lock();
            if core.listeners.is_empty() && core.state.is_error() && core.upstream.is_inactive() {
                cov_mark::hit!(live_error_cycle_reset);
                tracing::debug!(
                    store = %self.inner.label,
                    "starting a new cycle after source error"
                );
                core.state = StoreState::Empty;
            }
            core.listeners.insert(Arc::new(notifier))
        };

        self.inner.retain();

        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_listener(id);
            }
        })
    }
}

impl<S: Source> Drop for LiveStore<S> {
    fn drop(&mut self) {
        let subscription = self.inner.core.lock().upstream.clear();
        if let Some(subscription) = subscription {
            tracing::debug!(store = %self.inner.label, "store dropped, tearing down subscription");
            drop(subscription);
        }
        self.inner.suspender.resume();
    }
}
