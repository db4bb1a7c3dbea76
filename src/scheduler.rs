//! Re-evaluation driver for snapshot consumers
//!
//! A [`Scheduler`] plays the part of a rendering host. Each [`View`] reads one
//! store through [`snapshot()`](crate::ExternalStore::snapshot) and renders
//! the result. Views are queued when:
//!
//! - they are first watched,
//! - their store notifies a change,
//! - the suspension they were parked on completes.
//!
//! Nothing runs until [`flush()`](Scheduler::flush) is called. A flush drains
//! the queue to a fixed point, so work queued by a render is handled in the
//! same call.
//!
//! ```ignore
//! let scheduler = Scheduler::new();
//! let view = scheduler.watch(store.clone(), |result| println!("{result:?}"));
//! scheduler.flush(); // parks on the suspension
//! subject.next(1);
//! scheduler.flush(); // renders Ok(1)
//! ```

use crate::error::SnapshotError;
use crate::listeners::Unsubscribe;
use crate::store::ExternalStore;
use foldhash::fast::FixedState;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Wake, Waker};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct ViewId(u64);

/// Where a view is in its render cycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViewStatus {
    /// Waiting for the next flush
    Queued,
    /// Parked on a suspension; queued again once it completes
    Suspended,
    /// Last evaluation produced a value or an error
    Rendered,
}

enum Evaluation {
    Rendered,
    Suspended,
    /// The token completed between the read and the poll
    Retry,
}

type Evaluate = Box<dyn FnMut(&Waker) -> Evaluation + Send>;

struct ViewSlot {
    evaluate: Mutex<Evaluate>,
    status: Mutex<ViewStatus>,
    renders: AtomicUsize,
}

struct SchedulerInner {
    pending: Mutex<IndexSet<ViewId, FixedState>>,
    views: Mutex<IndexMap<ViewId, Arc<ViewSlot>, FixedState>>,
    next_id: AtomicU64,
    flushing: AtomicBool,
}

impl SchedulerInner {
    fn schedule(&self, id: ViewId) {
        let Some(slot) = self.views.lock().get(&id).cloned() else {
            return;
        };
        *slot.status.lock() = ViewStatus::Queued;
        self.pending.lock().insert(id);
    }
}

/// Wakes a parked view by queueing it again
struct ViewWaker {
    scheduler: Weak<SchedulerInner>,
    id: ViewId,
}

impl Wake for ViewWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            tracing::trace!(view = self.id.0, "suspension completed");
            scheduler.schedule(self.id);
        }
    }
}

/// Queue of views waiting to be rendered
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                pending: Mutex::new(IndexSet::default()),
                views: Mutex::new(IndexMap::default()),
                next_id: AtomicU64::new(0),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    /// Watch `store`, calling `render` with each value or error it yields
    ///
    /// The view subscribes to the store right away and is queued for its
    /// first evaluation. Dropping the returned [`View`] stops rendering and
    /// disposes the subscription.
    pub fn watch<St, R>(&self, store: Arc<St>, mut render: R) -> View
    where
        St: ExternalStore + Send + Sync + 'static,
        R: FnMut(Result<St::Item, St::Error>) + Send + 'static,
    {
        let id = ViewId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let reader = store.clone();
        let evaluate: Evaluate = Box::new(move |waker: &Waker| match reader.snapshot() {
            Ok(value) => {
                render(Ok(value));
                Evaluation::Rendered
            }
            Err(SnapshotError::Source(error)) => {
                render(Err(error));
                Evaluation::Rendered
            }
            Err(SnapshotError::Suspended(mut token)) => {
                let mut cx = Context::from_waker(waker);
                if Pin::new(&mut token).poll(&mut cx).is_ready() {
                    Evaluation::Retry
                } else {
                    Evaluation::Suspended
                }
            }
        });
        let slot = Arc::new(ViewSlot {
            evaluate: Mutex::new(evaluate),
            status: Mutex::new(ViewStatus::Queued),
            renders: AtomicUsize::new(0),
        });
        self.inner.views.lock().insert(id, slot.clone());

        let scheduler = Arc::downgrade(&self.inner);
        let listener = store.subscribe(move || {
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.schedule(id);
            }
        });
        self.inner.schedule(id);
        tracing::debug!(view = id.0, "watching store");

        View {
            id,
            slot,
            scheduler: Arc::downgrade(&self.inner),
            _listener: listener,
        }
    }

    /// Render every queued view until the queue stays empty
    ///
    /// Returns the number of evaluations that rendered. Only one flush runs
    /// at a time: a nested or concurrent call returns immediately and the
    /// running flush picks up whatever was queued.
    pub fn flush(&self) -> usize {
        let mut total = 0;
        loop {
            if self.inner.flushing.swap(true, Ordering::AcqRel) {
                cov_mark::hit!(flush_already_running);
                return total;
            }
            total += self.drain();
            self.inner.flushing.store(false, Ordering::Release);
            if self.inner.pending.lock().is_empty() {
                break;
            }
        }
        tracing::trace!(rendered = total, "flush finished");
        total
    }

    /// Number of views waiting for the next flush
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn drain(&self) -> usize {
        let mut rendered = 0;
        loop {
            let batch = std::mem::take(&mut *self.inner.pending.lock());
            if batch.is_empty() {
                return rendered;
            }
            for id in batch {
                let Some(slot) = self.inner.views.lock().get(&id).cloned() else {
                    continue;
                };
                let waker = Waker::from(Arc::new(ViewWaker {
                    scheduler: Arc::downgrade(&self.inner),
                    id,
                }));
                let evaluation = {
                    let mut evaluate = slot.evaluate.lock();
                    (*evaluate)(&waker)
                };
                let status = match evaluation {
                    Evaluation::Rendered => {
                        slot.renders.fetch_add(1, Ordering::Relaxed);
                        rendered += 1;
                        ViewStatus::Rendered
                    }
                    Evaluation::Suspended => ViewStatus::Suspended,
                    Evaluation::Retry => {
                        cov_mark::hit!(view_token_completed_during_poll);
                        self.inner.pending.lock().insert(id);
                        continue;
                    }
                };
                // A wake or notification during evaluation already queued it again
                let pending = self.inner.pending.lock();
                if !pending.contains(&id) {
                    *slot.status.lock() = status;
                }
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("views", &self.inner.views.lock().len())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Handle to a watched store
///
/// Dropping it removes the view from its scheduler and disposes the store
/// subscription.
pub struct View {
    id: ViewId,
    slot: Arc<ViewSlot>,
    scheduler: Weak<SchedulerInner>,
    _listener: Unsubscribe,
}

impl View {
    /// Current render status
    pub fn status(&self) -> ViewStatus {
        *self.slot.status.lock()
    }

    /// How many times the view rendered a value or an error
    pub fn render_count(&self) -> usize {
        self.slot.renders.load(Ordering::Relaxed)
    }
}

impl Drop for View {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.views.lock().swap_remove(&self.id);
            scheduler.pending.lock().swap_remove(&self.id);
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id.0)
            .field("status", &self.status())
            .field("renders", &self.render_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LiveStore, Subject};

    fn recording_view(
        scheduler: &Scheduler,
        store: Arc<LiveStore<Subject<u32, String>>>,
    ) -> (View, Arc<Mutex<Vec<Result<u32, String>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let view = scheduler.watch(store, move |result| sink.lock().push(result));
        (view, seen)
    }

    #[test]
    fn view_parks_until_first_value() {
        let subject = Subject::new();
        let store = Arc::new(LiveStore::new(subject.clone()));
        let scheduler = Scheduler::new();
        let (view, seen) = recording_view(&scheduler, store);

        assert_eq!(view.status(), ViewStatus::Queued);
        assert_eq!(scheduler.flush(), 0);
        assert_eq!(view.status(), ViewStatus::Suspended);

        subject.next(1);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.flush(), 1);
        assert_eq!(view.status(), ViewStatus::Rendered);
        assert_eq!(*seen.lock(), vec![Ok(1)]);
    }

    #[test]
    fn notifications_queue_each_view_once() {
        let subject = Subject::behavior(0);
        let store = Arc::new(LiveStore::new(subject.clone()));
        let scheduler = Scheduler::new();
        let (view, seen) = recording_view(&scheduler, store);
        scheduler.flush();

        subject.next(1);
        subject.next(2);
        assert_eq!(scheduler.pending_count(), 1);
        assert_eq!(scheduler.flush(), 1);
        assert_eq!(*seen.lock(), vec![Ok(0), Ok(2)]);
        assert_eq!(view.render_count(), 2);
    }

    #[test]
    fn errors_render_like_values() {
        let subject = Subject::new();
        let store = Arc::new(LiveStore::new(subject.clone()));
        let scheduler = Scheduler::new();
        let (_view, seen) = recording_view(&scheduler, store);
        scheduler.flush();

        subject.error("offline".to_owned());
        scheduler.flush();
        assert_eq!(*seen.lock(), vec![Err("offline".to_owned())]);
    }

    #[test]
    fn dropped_view_stops_rendering() {
        let subject = Subject::behavior(0);
        let store = Arc::new(LiveStore::new(subject.clone()));
        let scheduler = Scheduler::new();
        let (view, seen) = recording_view(&scheduler, store.clone());
        scheduler.flush();
        assert!(store.is_subscribed());

        drop(view);
        assert!(!store.is_subscribed());
        subject.next(1);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.flush(), 0);
        assert_eq!(*seen.lock(), vec![Ok(0)]);
    }

    #[test]
    fn nested_flush_defers_to_running_flush() {
        cov_mark::check!(flush_already_running);
        let subject = Subject::<u32, String>::behavior(0);
        let store = Arc::new(LiveStore::new(subject.clone()));
        let scheduler = Scheduler::new();
        let nested = scheduler.clone();
        let inner_counts = Arc::new(Mutex::new(Vec::new()));
        let sink = inner_counts.clone();
        let _view = scheduler.watch(store, move |_| sink.lock().push(nested.flush()));

        assert_eq!(scheduler.flush(), 1);
        assert_eq!(*inner_counts.lock(), vec![0]);
    }

    // Resumes its own suspension before handing it out, as a resume on
    // another thread between the read and the poll would.
    struct ResumedBeforePoll {
        suspender: crate::Suspender,
        reads: AtomicUsize,
    }

    impl ExternalStore for ResumedBeforePoll {
        type Item = u32;
        type Error = String;

        fn snapshot(&self) -> Result<u32, SnapshotError<String>> {
            if self.reads.fetch_add(1, Ordering::Relaxed) == 0 {
                let token = self.suspender.suspend();
                self.suspender.resume();
                return Err(SnapshotError::Suspended(token));
            }
            Ok(7)
        }

        fn subscribe<F>(&self, _notifier: F) -> Unsubscribe
        where
            F: Fn() + Send + Sync + 'static,
        {
            Unsubscribe::new(|| {})
        }
    }

    #[test]
    fn token_completed_before_poll_requeues_view() {
        cov_mark::check!(view_token_completed_during_poll);
        let store = Arc::new(ResumedBeforePoll {
            suspender: crate::Suspender::new(),
            reads: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let view = scheduler.watch(store.clone(), move |result| sink.lock().push(result));

        assert_eq!(scheduler.flush(), 1);
        assert_eq!(view.status(), ViewStatus::Rendered);
        assert_eq!(store.reads.load(Ordering::Relaxed), 2);
        assert_eq!(*seen.lock(), vec![Ok(7)]);
    }
}
