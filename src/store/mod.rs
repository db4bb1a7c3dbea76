//! Snapshot stores over push-based sources
//!
//! Two strategies implement the same [`ExternalStore`] contract:
//!
//! - [`LiveStore`] keeps one upstream subscription alive for as long as a
//!   listener (or a reader waiting for the first value) exists. Every emission
//!   refreshes the cache.
//! - [`FetchOnceStore`] fills an empty cache with a single deduplicated fetch
//!   through a shared replay view and keeps that value until it is explicitly
//!   invalidated. Listeners still get a live subscription while registered.
//!
//! [`Store`] dispatches to either one and is what [`StoreBuilder`] produces.

mod builder;
mod fetch_once;
mod live;

pub use builder::{RetentionPolicy, Store, StoreBuilder};
pub use fetch_once::FetchOnceStore;
pub use live::LiveStore;

use crate::error::SnapshotError;
use crate::listeners::{ListenerId, Notifier, Unsubscribe};
use crate::source::Subscription;
use crate::suspender::Suspension;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Label used in log events when none was configured
pub(crate) const DEFAULT_LABEL: &str = "store";

/// Cached state of a store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreState<T, E> {
    /// Nothing cached; reads suspend
    Empty,
    /// Latest value emitted by the source
    HasValue(T),
    /// The source failed; reads re-raise this error
    HasError(E),
}

impl<T: Clone, E: Clone> StoreState<T, E> {
    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        matches!(self, StoreState::Empty)
    }

    /// True when an error is cached
    pub fn is_error(&self) -> bool {
        matches!(self, StoreState::HasError(_))
    }

    /// Answer a read, or hand back `token` when nothing is cached
    pub(crate) fn read_or_suspend(&self, token: Suspension) -> Result<T, SnapshotError<E>> {
        match self {
            StoreState::HasValue(value) => Ok(value.clone()),
            StoreState::HasError(error) => Err(SnapshotError::Source(error.clone())),
            StoreState::Empty => Err(SnapshotError::Suspended(token)),
        }
    }

    /// Answer a read from a non-empty cache
    pub(crate) fn read_cached(&self) -> Option<Result<T, SnapshotError<E>>> {
        match self {
            StoreState::HasValue(value) => Some(Ok(value.clone())),
            StoreState::HasError(error) => Some(Err(SnapshotError::Source(error.clone()))),
            StoreState::Empty => None,
        }
    }
}

/// The surface a snapshot consumer depends on
///
/// A consumer calls [`snapshot()`](Self::snapshot) on every evaluation and
/// registers through [`subscribe()`](Self::subscribe) to learn when to
/// evaluate again. A [`SnapshotError::Suspended`] answer means "retry once the
/// token completes", never "failed".
pub trait ExternalStore {
    /// Value type handed to readers
    type Item;
    /// Source error type re-raised to readers
    type Error;

    /// Read the cached value without blocking
    fn snapshot(&self) -> Result<Self::Item, SnapshotError<Self::Error>>;

    /// Register `notifier` to be called on every value or error transition
    fn subscribe<F>(&self, notifier: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static;

    /// Wait for a value (or error) by retrying after each suspension
    fn read(&self) -> Read<'_, Self> {
        Read {
            store: self,
            waiting: None,
        }
    }
}

/// Future returned by [`ExternalStore::read`]
#[must_use = "futures do nothing unless polled"]
pub struct Read<'a, S: ?Sized> {
    store: &'a S,
    waiting: Option<Suspension>,
}

impl<S: ExternalStore + ?Sized> Future for Read<'_, S> {
    type Output = Result<S::Item, S::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            if let Some(token) = this.waiting.as_mut() {
                if Pin::new(token).poll(cx).is_pending() {
                    return Poll::Pending;
                }
                this.waiting = None;
            }

            match this.store.snapshot() {
                Ok(value) => return Poll::Ready(Ok(value)),
                Err(SnapshotError::Source(error)) => return Poll::Ready(Err(error)),
                Err(SnapshotError::Suspended(token)) => this.waiting = Some(token),
            }
        }
    }
}

/// Upstream subscription slot
///
/// Every connection attempt gets a ticket. Observers carry the ticket they
/// were created with, so deliveries from a torn-down attempt are ignored.
pub(crate) enum Upstream {
    Inactive,
    /// `subscribe` is running and may deliver before it returns
    Connecting(u64),
    Active(u64, Subscription),
}

impl Upstream {
    pub(crate) fn is_inactive(&self) -> bool {
        matches!(self, Upstream::Inactive)
    }

    pub(crate) fn ticket(&self) -> Option<u64> {
        match self {
            Upstream::Inactive => None,
            Upstream::Connecting(ticket) | Upstream::Active(ticket, _) => Some(*ticket),
        }
    }

    /// Reset to inactive, returning the subscription to drop (outside any lock)
    pub(crate) fn clear(&mut self) -> Option<Subscription> {
        match std::mem::replace(self, Upstream::Inactive) {
            Upstream::Active(_, subscription) => Some(subscription),
            Upstream::Inactive | Upstream::Connecting(_) => None,
        }
    }

    /// Install the subscription for `ticket` once `subscribe` returned
    ///
    /// Hands the subscription back when the attempt was abandoned meanwhile.
    pub(crate) fn settle(
        &mut self,
        ticket: u64,
        subscription: Subscription,
    ) -> Option<Subscription> {
        match self {
            Upstream::Connecting(current) if *current == ticket => {
                *self = Upstream::Active(ticket, subscription);
                None
            }
            _ => Some(subscription),
        }
    }
}

/// Call each notifier that is still registered when its turn comes
///
/// A listener disposed by an earlier notifier in the same fan-out is skipped.
pub(crate) fn notify_listeners<F>(targets: Vec<(ListenerId, Notifier)>, still_registered: F)
where
    F: Fn(ListenerId) -> bool,
{
    for (id, notifier) in targets {
        if still_registered(id) {
            notifier();
        }
    }
}
