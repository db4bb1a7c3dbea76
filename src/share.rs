//! Reference-counted replay multicast
//!
//! [`ShareReplay`] turns any [`Source`] into one that shares a single upstream
//! subscription between all of its observers:
//!
//! - The upstream is subscribed when the first observer arrives.
//! - Every emission is remembered (buffer of one) and replayed to observers
//!   that join later.
//! - When the last observer leaves, the upstream is torn down and, unless
//!   the view was built with [`with_keep_replay`](ShareReplay::with_keep_replay),
//!   the replay buffer is cleared.
//! - An upstream error is forwarded to everyone, then the view resets so the
//!   next observer reconnects from scratch.

use crate::source::{Observer, ObserverKey, ObserverSet, Source, Subscription};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Shared, replaying view over an upstream source
pub struct ShareReplay<S: Source> {
    inner: Arc<ShareInner<S>>,
}

struct ShareInner<S: Source> {
    upstream: S,
    keep_replay: bool,
    state: Mutex<ShareState<S::Item, S::Error>>,
}

struct ShareState<T, E> {
    observers: ObserverSet<T, E>,
    latest: Option<T>,
    connection: Connection,
    /// Bumped on every reset so a late upstream handle can tell it is stale
    epoch: u64,
}

enum Connection {
    Idle,
    /// `upstream.subscribe` is running; it may emit before returning
    Connecting,
    Connected(Subscription),
}

impl<S: Source> Clone for ShareReplay<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Source> ShareReplay<S> {
    /// Share `upstream`, clearing the replay buffer whenever it goes idle
    pub fn new(upstream: S) -> Self {
        Self::with_keep_replay(upstream, false)
    }

    /// Share `upstream`, choosing whether the last value survives going idle
    ///
    /// With `keep_replay` set, an observer that arrives after everyone left
    /// is replayed the value last seen before the upstream was torn down.
    pub fn with_keep_replay(upstream: S, keep_replay: bool) -> Self {
        Self {
            inner: Arc::new(ShareInner {
                upstream,
                keep_replay,
                state: Mutex::new(ShareState {
                    observers: ObserverSet::new(),
                    latest: None,
                    connection: Connection::Idle,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Number of observers attached to the view
    pub fn observer_count(&self) -> usize {
        self.inner.state.lock().observers.len()
    }

    /// True while the upstream subscription is live (or being established)
    pub fn is_connected(&self) -> bool {
        !matches!(self.inner.state.lock().connection, Connection::Idle)
    }

    /// The value that would be replayed to a new observer
    pub fn latest(&self) -> Option<S::Item> {
        self.inner.state.lock().latest.clone()
    }
}

impl<S: Source> ShareInner<S> {
    fn connect(self: &Arc<Self>, epoch: u64) {
        let relay: Arc<dyn Observer<S::Item, S::Error>> = Arc::new(Relay {
            inner: Arc::downgrade(self),
            epoch,
        });
        tracing::debug!("share_replay connecting upstream");
        let subscription = self.upstream.subscribe(relay);

        let mut state = self.state.lock();
        let still_wanted = state.epoch == epoch
            && matches!(state.connection, Connection::Connecting)
            && !state.observers.is_empty();
        if still_wanted {
            state.connection = Connection::Connected(subscription);
        } else {
            // Everyone left (or the upstream failed) while subscribing
            if state.epoch == epoch && matches!(state.connection, Connection::Connecting) {
                state.connection = Connection::Idle;
            }
            drop(state);
            drop(subscription);
        }
    }

    fn remove(&self, key: ObserverKey) {
        let torn_down = {
            let mut state = self.state.lock();
            if !state.observers.remove(key) || !state.observers.is_empty() {
                return;
            }
            if !self.keep_replay {
                state.latest = None;
            }
            state.epoch += 1;
            std::mem::replace(&mut state.connection, Connection::Idle)
        };

        if let Connection::Connected(subscription) = torn_down {
            tracing::debug!("share_replay releasing upstream");
            drop(subscription);
        }
    }

    fn relay_next(&self, epoch: u64, value: S::Item) {
        let observers = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.latest = Some(value.clone());
            state.observers.snapshot()
        };
        for observer in observers {
            observer.on_next(value.clone());
        }
    }

    fn relay_error(&self, epoch: u64, error: S::Error) {
        let (observers, connection) = {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                return;
            }
            state.epoch += 1;
            state.latest = None;
            let connection = std::mem::replace(&mut state.connection, Connection::Idle);
            (state.observers.drain(), connection)
        };
        drop(connection);

        for observer in observers {
            observer.on_error(error.clone());
        }
    }
}

/// Observer registered upstream on behalf of the whole view
struct Relay<S: Source> {
    inner: Weak<ShareInner<S>>,
    epoch: u64,
}

impl<S: Source> Observer<S::Item, S::Error> for Relay<S> {
    fn on_next(&self, value: S::Item) {
        if let Some(inner) = self.inner.upgrade() {
            inner.relay_next(self.epoch, value);
        }
    }

    fn on_error(&self, error: S::Error) {
        if let Some(inner) = self.inner.upgrade() {
            inner.relay_error(self.epoch, error);
        }
    }
}

impl<S: Source> ShareReplay<S> {
    /// Like [`Source::subscribe`], but a value kept from a torn-down upstream
    /// is not replayed; only a live connection's latest value is.
    pub(crate) fn subscribe_fresh(
        &self,
        observer: Arc<dyn Observer<S::Item, S::Error>>,
    ) -> Subscription {
        self.attach(observer, Replay::WhileConnected)
    }

    fn attach(
        &self,
        observer: Arc<dyn Observer<S::Item, S::Error>>,
        mode: Replay,
    ) -> Subscription {
        let (key, replay, connect_epoch) = {
            let mut state = self.inner.state.lock();
            let key = state.observers.insert(observer.clone());
            let replay = match (mode, &state.connection) {
                (Replay::Always, _) | (Replay::WhileConnected, Connection::Connected(_)) => {
                    state.latest.clone()
                }
                (Replay::WhileConnected, _) => {
                    if state.latest.is_some() {
                        cov_mark::hit!(share_replay_stale_value_skipped);
                    }
                    None
                }
            };
            let connect_epoch = match state.connection {
                Connection::Idle => {
                    state.connection = Connection::Connecting;
                    Some(state.epoch)
                }
                _ => None,
            };
            (key, replay, connect_epoch)
        };

        if let Some(value) = replay {
            cov_mark::hit!(share_replay_replayed);
            observer.on_next(value);
        }
        if let Some(epoch) = connect_epoch {
            self.inner.connect(epoch);
        }

        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(key);
            }
        })
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Replay {
    Always,
    WhileConnected,
}

impl<S: Source> Source for ShareReplay<S> {
    type Item = S::Item;
    type Error = S::Error;

    fn subscribe(&self, observer: Arc<dyn Observer<S::Item, S::Error>>) -> Subscription {
        self.attach(observer, Replay::Always)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Subject;
    use crate::source::observer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn Observer<u32, String>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let obs = observer(
            move |_: u32| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            },
            |_: String| {},
        );
        (count, obs)
    }

    #[test]
    fn share_replay_uses_one_upstream_subscription() {
        let subject = Subject::<u32, String>::new();
        let shared = subject.clone().share_replay();

        let (a_count, a) = counting();
        let (b_count, b) = counting();
        let sub_a = shared.subscribe(a);
        let sub_b = shared.subscribe(b);
        assert_eq!(subject.observer_count(), 1);
        assert!(shared.is_connected());

        subject.next(7);
        assert_eq!(a_count.load(Ordering::Relaxed), 1);
        assert_eq!(b_count.load(Ordering::Relaxed), 1);

        drop(sub_a);
        assert_eq!(subject.observer_count(), 1);
        drop(sub_b);
        assert_eq!(subject.observer_count(), 0);
        assert!(!shared.is_connected());
    }

    #[test]
    fn share_replay_replays_latest_to_late_observer() {
        cov_mark::check!(share_replay_replayed);
        let subject = Subject::<u32, String>::new();
        let shared = ShareReplay::new(subject.clone());

        let (_, first) = counting();
        let _first = shared.subscribe(first);
        subject.next(3);

        let (late_count, late) = counting();
        let _late = shared.subscribe(late);
        assert_eq!(late_count.load(Ordering::Relaxed), 1);
        assert_eq!(shared.latest(), Some(3));
    }

    #[test]
    fn idle_view_clears_replay_unless_kept() {
        let subject = Subject::<u32, String>::new();
        let reset = ShareReplay::new(subject.clone());
        let kept = ShareReplay::with_keep_replay(subject.clone(), true);

        let (_, a) = counting();
        let (_, b) = counting();
        let sub_a = reset.subscribe(a);
        let sub_b = kept.subscribe(b);
        subject.next(1);
        drop(sub_a);
        drop(sub_b);

        assert_eq!(reset.latest(), None);
        assert_eq!(kept.latest(), Some(1));
    }

    #[test]
    fn upstream_error_resets_view() {
        let subject = Subject::<u32, String>::new();
        let shared = ShareReplay::new(subject.clone());

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        let _sub = shared.subscribe(observer(
            |_: u32| {},
            move |_: String| {
                errors_clone.fetch_add(1, Ordering::Relaxed);
            },
        ));
        subject.next(1);
        subject.error("boom".into());

        assert_eq!(errors.load(Ordering::Relaxed), 1);
        assert_eq!(shared.observer_count(), 0);
        assert!(!shared.is_connected());
        assert_eq!(shared.latest(), None);
    }

    #[test]
    fn synchronous_upstream_replay_reaches_first_observer() {
        let subject = Subject::<u32, String>::behavior(42);
        let shared = ShareReplay::new(subject.clone());

        let (count, obs) = counting();
        let _sub = shared.subscribe(obs);
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(shared.latest(), Some(42));
        assert!(shared.is_connected());
    }

    #[test]
    fn fresh_subscriber_skips_value_kept_from_idle_view() {
        cov_mark::check!(share_replay_stale_value_skipped);
        let subject = Subject::<u32, String>::new();
        let kept = ShareReplay::with_keep_replay(subject.clone(), true);

        let (_, first) = counting();
        let sub = kept.subscribe(first);
        subject.next(2);
        drop(sub);
        assert_eq!(kept.latest(), Some(2));

        let (count, fresh) = counting();
        let _sub = kept.subscribe_fresh(fresh);
        assert_eq!(count.load(Ordering::Relaxed), 0);
        subject.next(3);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fresh_subscriber_gets_latest_of_live_connection() {
        let subject = Subject::<u32, String>::new();
        let shared = ShareReplay::new(subject.clone());
        let (_, first) = counting();
        let _held = shared.subscribe(first);
        subject.next(5);

        let (count, fresh) = counting();
        let _sub = shared.subscribe_fresh(fresh);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }
}
