use super::{DEFAULT_LABEL, ExternalStore, StoreState, Upstream, notify_listeners};
use crate::error::SnapshotError;
use crate::listeners::{ListenerId, Listeners, Notifier, Unsubscribe};
use crate::share::ShareReplay;
use crate::source::{Observer, Source, Subscription};
use crate::suspender::Suspender;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::{Arc, Weak};

/// Store that fills an empty cache with one deduplicated fetch
///
/// The source is wrapped in a [`ShareReplay`] view. A read on an empty cache
/// subscribes to that view just long enough to receive one value, so any
/// number of readers (and any number of stores built over the same view with
/// [`from_shared`](Self::from_shared)) share a single upstream fetch. The
/// value stays cached until [`invalidate()`](Self::invalidate), even when
/// nobody is listening.
///
/// Listeners get a live subscription to the view while registered, so they see
/// every value and error that arrives meanwhile. A fetch and the listener
/// subscription never run side by side.
///
/// # Example
/// ```ignore
/// let store = FetchOnceStore::new(config_source);
///
/// let pending = store.snapshot();   // Suspended, fetch started
/// // ... source emits ...
/// let config = store.snapshot()?;   // Cached; the fetch is already gone
///
/// store.invalidate();               // Next read fetches again
/// ```
pub struct FetchOnceStore<S: Source> {
    inner: Arc<FetchInner<S>>,
}

struct FetchInner<S: Source> {
    shared: ShareReplay<S>,
    label: Cow<'static, str>,
    suspender: Suspender,
    core: Mutex<FetchCore<S::Item, S::Error>>,
}

struct FetchCore<T, E> {
    state: StoreState<T, E>,
    listeners: Listeners,
    /// Held while listeners are registered
    live: Upstream,
    /// Held while a read waits for its single value
    fetch: Upstream,
    next_ticket: u64,
    /// Set by `invalidate` until the cache is filled again. While set, a value
    /// the shared view kept from a torn-down upstream is not replayed.
    refetch: bool,
}

impl<T, E> FetchCore<T, E> {
    fn ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    Live,
    Fetch,
}

impl<S: Source> FetchOnceStore<S> {
    /// Wrap `source` in a private shared view
    pub fn new(source: S) -> Self {
        Self::from_shared(ShareReplay::new(source))
    }

    /// Build over an existing view; stores sharing a view share its upstream
    pub fn from_shared(shared: ShareReplay<S>) -> Self {
        Self::with_label(shared, DEFAULT_LABEL)
    }

    pub(crate) fn with_label(shared: ShareReplay<S>, label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(FetchInner {
                shared,
                label: label.into(),
                suspender: Suspender::new(),
                core: Mutex::new(FetchCore {
                    state: StoreState::Empty,
                    listeners: Listeners::new(),
                    live: Upstream::Inactive,
                    fetch: Upstream::Inactive,
                    next_ticket: 0,
                    refetch: false,
                }),
            }),
        }
    }

    /// Name used in log events
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// True while either a fetch or the listener subscription is held
    pub fn is_subscribed(&self) -> bool {
        let core = self.inner.core.lock();
        !core.live.is_inactive() || !core.fetch.is_inactive()
    }

    /// True while a single-shot fetch is outstanding
    pub fn is_fetching(&self) -> bool {
        !self.inner.core.lock().fetch.is_inactive()
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.core.lock().listeners.len()
    }

    /// Copy of the cached state
    pub fn state(&self) -> StoreState<S::Item, S::Error> {
        self.inner.core.lock().state.clone()
    }

    /// The shared view this store fetches through
    pub fn shared(&self) -> &ShareReplay<S> {
        &self.inner.shared
    }

    /// Empty the cache (value or error) and notify listeners
    ///
    /// The next read fetches again. If listeners are registered but their
    /// subscription ended with an error, it is re-established.
    pub fn invalidate(&self) {
        let (targets, reattach) = {
            let mut core = self.inner.core.lock();
            if core.state.is_empty() {
                return;
            }
            core.state = StoreState::Empty;
            core.refetch = true;
            let reattach = if !core.listeners.is_empty() && core.live.is_inactive() {
                let ticket = core.ticket();
                core.live = Upstream::Connecting(ticket);
                Some(ticket)
            } else {
                None
            };
            (core.listeners.snapshot(), reattach)
        };

        tracing::debug!(store = %self.inner.label, "cache invalidated");
        if let Some(ticket) = reattach {
            self.inner.attach_live(ticket);
        }
        self.inner.notify(targets);
    }
}

impl<S: Source> FetchInner<S> {
    fn observer(self: &Arc<Self>, role: Role, ticket: u64) -> Arc<dyn Observer<S::Item, S::Error>> {
        Arc::new(FetchObserver {
            inner: Arc::downgrade(self),
            role,
            ticket,
        })
    }

    fn subscribe_shared(&self, observer: Arc<dyn Observer<S::Item, S::Error>>) -> Subscription {
        if self.core.lock().refetch {
            self.shared.subscribe_fresh(observer)
        } else {
            self.shared.subscribe(observer)
        }
    }

    /// Subscribe to the shared view for a single value
    fn start_fetch(self: &Arc<Self>, ticket: u64) {
        tracing::debug!(store = %self.label, "fetching first value");
        let subscription = self.subscribe_shared(self.observer(Role::Fetch, ticket));

        let finished = self.core.lock().fetch.settle(ticket, subscription);
        if let Some(subscription) = finished {
            // Answered (or cancelled) before subscribe returned
            drop(subscription);
        }
    }

    /// Subscribe to the shared view on behalf of the listeners
    fn attach_live(self: &Arc<Self>, ticket: u64) {
        tracing::debug!(store = %self.label, "retaining live subscription");
        let subscription = self.subscribe_shared(self.observer(Role::Live, ticket));

        let (abandoned, cancelled_fetch) = {
            let mut core = self.core.lock();
            let abandoned = core.live.settle(ticket, subscription);
            let cancelled_fetch = if core.fetch.is_inactive() {
                None
            } else {
                cov_mark::hit!(fetch_cancelled_by_listener);
                core.fetch.clear()
            };
            (abandoned, cancelled_fetch)
        };

        // The live subscription is already attached, so dropping the fetch
        // does not let the shared view go idle in between.
        drop(cancelled_fetch);
        drop(abandoned);
    }

    fn remove_listener(self: &Arc<Self>, id: ListenerId) {
        let (live, handover) = {
            let mut core = self.core.lock();
            if !core.listeners.remove(id) || !core.listeners.is_empty() {
                return;
            }
            let live = core.live.clear();
            let handover = if core.state.is_empty()
                && self.suspender.is_suspended()
                && core.fetch.is_inactive()
            {
                cov_mark::hit!(fetch_takes_over_parked_read);
                let ticket = core.ticket();
                core.fetch = Upstream::Connecting(ticket);
                Some(ticket)
            } else {
                None
            };
            (live, handover)
        };

        // Start the replacement fetch before letting go of the live
        // subscription so the shared upstream stays connected.
        if let Some(ticket) = handover {
            self.start_fetch(ticket);
        }
        if let Some(live) = live {
            tracing::debug!(store = %self.label, "releasing live subscription");
            drop(live);
        }
    }

    fn notify(&self, targets: Vec<(ListenerId, Notifier)>) {
        notify_listeners(targets, |id| self.core.lock().listeners.contains(id));
    }

    /// Apply a transition delivered on `role`'s subscription
    fn apply(&self, role: Role, ticket: u64, state: StoreState<S::Item, S::Error>) {
        let failed = state.is_error();
        let (targets, finished) = {
            let mut core = self.core.lock();
            let slot = match role {
                Role::Live => &mut core.live,
                Role::Fetch => &mut core.fetch,
            };
            if slot.ticket() != Some(ticket) {
                return;
            }
            // A fetch ends with its first delivery; a live subscription ends
            // only when the source fails.
            let finished: Option<Subscription> = if role == Role::Fetch || failed {
                slot.clear()
            } else {
                None
            };
            core.state = state;
            core.refetch = false;
            (core.listeners.snapshot(), finished)
        };

        match (role, failed) {
            (Role::Fetch, false) => tracing::debug!(store = %self.label, "fetched value"),
            (Role::Live, false) => {
                tracing::trace!(store = %self.label, listeners = targets.len(), "value received")
            }
            (_, true) => {
                let listeners = targets.len();
                tracing::debug!(store = %self.label, listeners, "source error captured")
            }
        }
        drop(finished);
        self.suspender.resume();
        self.notify(targets);
    }
}

struct FetchObserver<S: Source> {
    inner: Weak<FetchInner<S>>,
    role: Role,
    ticket: u64,
}

impl<S: Source> Observer<S::Item, S::Error> for FetchObserver<S> {
    fn on_next(&self, value: S::Item) {
        if let Some(inner) = self.inner.upgrade() {
            inner.apply(self.role, self.ticket, StoreState::HasValue(value));
        }
    }

    fn on_error(&self, error: S::Error) {
        if let Some(inner) = self.inner.upgrade() {
            inner.apply(self.role, self.ticket, StoreState::HasError(error));
        }
    }
}

impl<S: Source> ExternalStore for FetchOnceStore<S> {
    type Item = S::Item;
    type Error = S::Error;

    fn snapshot(&self) -> Result<S::Item, SnapshotError<S::Error>> {
        let (token, fetch) = {
            let mut core = self.inner.core.lock();
            if let Some(cached) = core.state.read_cached() {
                return cached;
            }
            let token = self.inner.suspender.suspend();
            let fetch = if !core.live.is_inactive() {
                // The listener subscription will fill the cache.
                None
            } else if !core.fetch.is_inactive() {
                cov_mark::hit!(fetch_deduplicated);
                None
            } else {
                let ticket = core.ticket();
                core.fetch = Upstream::Connecting(ticket);
                Some(ticket)
            };
            (token, fetch)
        };

        if let Some(ticket) = fetch {
            self.inner.start_fetch(ticket);
        }
        self.inner.core.lock().state.read_or_suspend(token)
    }

    fn subscribe<F>(&self, notifier: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (id, attach) = {
            let mut core = self.inner.core.lock();
            if core.listeners.is_empty() && core.state.is_error() && core.live.is_inactive() {
                cov_mark::hit!(fetch_once_error_cycle_reset);
                tracing::debug!(
                    store = %self.inner.label,
                    "starting a new cycle after source error"
                );
                core.state = StoreState::Empty;
            }
            let id = core.listeners.insert(Arc::new(notifier));
            let attach = if core.live.is_inactive() && !core.state.is_error() {
                let ticket = core.ticket();
                core.live = Upstream::Connecting(ticket);
                Some(ticket)
            } else {
                None
            };
            (id, attach)
        };

        if let Some(ticket) = attach {
            self.inner.attach_live(ticket);
        }

        let inner = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_listener(id);
            }
        })
    }
}

impl<S: Source> Drop for FetchOnceStore<S> {
    fn drop(&mut self) {
        let (live, fetch) = {
            let mut core = self.inner.core.lock();
            (core.live.clear(), core.fetch.clear())
        };
        if live.is_some() || fetch.is_some() {
            tracing::debug!(store = %self.inner.label, "store dropped, tearing down subscriptions");
        }
        drop(live);
        drop(fetch);
        self.inner.suspender.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Subject;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn read_fetches_once_and_keeps_value() {
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        assert!(store.snapshot().unwrap_err().is_suspended());
        assert!(store.is_fetching());
        assert_eq!(subject.observer_count(), 1);

        subject.next(4);
        assert!(!store.is_subscribed());
        assert_eq!(subject.observer_count(), 0);

        // Later emissions do not reach a store nobody listens to
        subject.next(5);
        assert_eq!(store.snapshot().unwrap(), 4);
    }

    #[test]
    fn concurrent_reads_share_one_fetch() {
        cov_mark::check!(fetch_deduplicated);
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        let a = store.snapshot().unwrap_err();
        let b = store.snapshot().unwrap_err();
        assert!(crate::Suspension::ptr_eq(
            a.suspension().unwrap(),
            b.suspension().unwrap()
        ));
        assert_eq!(subject.observer_count(), 1);

        subject.next(1);
        assert!(a.suspension().unwrap().is_resolved());
    }

    #[test]
    fn stores_over_one_view_share_the_upstream() {
        let subject = Subject::<u32, String>::new();
        let shared = subject.clone().share_replay();
        let first = FetchOnceStore::from_shared(shared.clone());
        let second = FetchOnceStore::from_shared(shared.clone());

        let _a = first.snapshot();
        let _b = second.snapshot();
        assert_eq!(shared.observer_count(), 2);
        assert_eq!(subject.observer_count(), 1);

        subject.next(8);
        assert_eq!(first.snapshot().unwrap(), 8);
        assert_eq!(second.snapshot().unwrap(), 8);
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn invalidate_refetches() {
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        let _ = store.snapshot();
        subject.next(1);
        assert_eq!(store.snapshot().unwrap(), 1);

        store.invalidate();
        assert!(store.state().is_empty());
        assert!(store.snapshot().unwrap_err().is_suspended());
        subject.next(2);
        assert_eq!(store.snapshot().unwrap(), 2);
    }

    #[test]
    fn invalidate_ignores_value_kept_by_idle_view() {
        cov_mark::check!(share_replay_stale_value_skipped);
        let subject = Subject::<u32, String>::new();
        let shared = ShareReplay::with_keep_replay(subject.clone(), true);
        let store = FetchOnceStore::from_shared(shared);

        let _ = store.snapshot();
        subject.next(1);
        assert_eq!(store.shared().latest(), Some(1));

        store.invalidate();
        assert!(store.snapshot().unwrap_err().is_suspended());
        assert!(store.is_fetching());
        subject.next(2);
        assert_eq!(store.snapshot().unwrap(), 2);

        // Once refilled, the kept value serves a new store again
        let other = FetchOnceStore::from_shared(store.shared().clone());
        assert_eq!(other.snapshot().unwrap(), 2);
    }

    #[test]
    fn listener_sees_every_value_and_cancels_fetch() {
        cov_mark::check!(fetch_cancelled_by_listener);
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        let _ = store.snapshot();
        assert!(store.is_fetching());

        let notified = Arc::new(AtomicUsize::new(0));
        let notified_clone = notified.clone();
        let listener = store.subscribe(move || {
            notified_clone.fetch_add(1, Ordering::Relaxed);
        });
        assert!(!store.is_fetching());
        assert_eq!(subject.observer_count(), 1);

        subject.next(1);
        subject.next(2);
        assert_eq!(notified.load(Ordering::Relaxed), 2);
        assert_eq!(store.snapshot().unwrap(), 2);

        listener.dispose();
        assert!(!store.is_subscribed());
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn last_listener_hands_parked_read_to_a_fetch() {
        cov_mark::check!(fetch_takes_over_parked_read);
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        let listener = store.subscribe(|| {});
        let pending = store.snapshot().unwrap_err();
        listener.dispose();

        assert!(store.is_fetching());
        assert_eq!(subject.observer_count(), 1);
        subject.next(3);
        assert!(pending.suspension().unwrap().is_resolved());
        assert_eq!(store.snapshot().unwrap(), 3);
    }

    #[test]
    fn fetch_error_resumes_reader_and_invalidate_clears_it() {
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        let pending = store.snapshot().unwrap_err();
        subject.error("boom".into());
        assert!(pending.suspension().unwrap().is_resolved());
        assert_eq!(store.snapshot().unwrap_err().into_source(), Some("boom".to_string()));
        assert_eq!(store.snapshot().unwrap_err().into_source(), Some("boom".to_string()));

        store.invalidate();
        assert!(store.state().is_empty());
    }

    #[test]
    fn first_listener_after_error_starts_new_cycle() {
        cov_mark::check!(fetch_once_error_cycle_reset);
        let subject = Subject::<u32, String>::new();
        let store = FetchOnceStore::new(subject.clone());

        let _ = store.snapshot();
        subject.error("boom".into());
        assert!(store.state().is_error());

        let _listener = store.subscribe(|| {});
        // Terminated subject replays the error into the fresh cycle
        assert!(store.state().is_error());
        assert!(!store.is_subscribed());
    }
}
