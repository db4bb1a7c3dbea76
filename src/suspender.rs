use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};

/// Single-slot suspension signal shared by every reader of one store
///
/// At most one [`Suspension`] is pending at a time. Readers that ask for a
/// value while the slot is occupied receive the same token, so one
/// [`resume()`](Suspender::resume) releases all of them together.
///
/// # Example
/// ```ignore
/// let suspender = Suspender::new();
///
/// let a = suspender.suspend();
/// let b = suspender.suspend();  // Coalesced: same token as `a`
/// assert!(Suspension::ptr_eq(&a, &b));
///
/// suspender.resume();           // Wakes everyone awaiting `a` or `b`
/// assert!(a.is_resolved());
/// assert!(!suspender.is_suspended());
/// ```
#[derive(Default)]
pub struct Suspender {
    pending: Mutex<Option<Suspension>>,
}

impl Suspender {
    /// Create an idle suspender
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pending token, creating one if the slot is empty
    pub fn suspend(&self) -> Suspension {
        let mut pending = self.pending.lock();
        match &*pending {
            Some(token) => {
                cov_mark::hit!(suspension_coalesced);
                token.clone()
            }
            None => {
                let token = Suspension::new();
                *pending = Some(token.clone());
                token
            }
        }
    }

    /// Complete the pending token and clear the slot
    ///
    /// Returns false when nothing was pending.
    pub fn resume(&self) -> bool {
        // Take the token first so wakers run without the slot locked.
        let Some(token) = self.pending.lock().take() else {
            return false;
        };
        token.resolve();
        true
    }

    /// True while a token is pending
    pub fn is_suspended(&self) -> bool {
        self.pending.lock().is_some()
    }
}

impl Drop for Suspender {
    fn drop(&mut self) {
        // Nobody can resume a dropped suspender, release its waiters now.
        if let Some(token) = self.pending.get_mut().take() {
            token.resolve();
        }
    }
}

impl fmt::Debug for Suspender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspender")
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// Handle to a pending suspension
///
/// Completes (as a [`Future`]) once the owning [`Suspender`] resumes. Clones
/// share the same completion, which is how concurrent readers are coalesced.
#[derive(Clone)]
pub struct Suspension {
    shared: Arc<SuspensionShared>,
}

struct SuspensionShared {
    resolved: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
}

impl Suspension {
    fn new() -> Self {
        Self {
            shared: Arc::new(SuspensionShared {
                resolved: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// True once the suspender has resumed this token
    pub fn is_resolved(&self) -> bool {
        self.shared.resolved.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same suspension
    pub fn ptr_eq(a: &Suspension, b: &Suspension) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    fn resolve(&self) {
        let wakers = {
            let mut wakers = self.shared.wakers.lock();
            self.shared.resolved.store(true, Ordering::Release);
            std::mem::take(&mut *wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl Future for Suspension {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_resolved() {
            return Poll::Ready(());
        }

        let mut wakers = self.shared.wakers.lock();
        // resolve() flips the flag under this lock, so checking again here
        // cannot miss a wake-up.
        if self.shared.resolved.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn suspend_coalesces_until_resume() {
        cov_mark::check!(suspension_coalesced);
        let suspender = Suspender::new();
        assert!(!suspender.is_suspended());

        let first = suspender.suspend();
        let second = suspender.suspend();
        assert!(Suspension::ptr_eq(&first, &second));
        assert!(suspender.is_suspended());

        assert!(suspender.resume());
        assert!(first.is_resolved());
        assert!(second.is_resolved());
        assert!(!suspender.is_suspended());

        // A new cycle gets a fresh token
        let third = suspender.suspend();
        assert!(!Suspension::ptr_eq(&first, &third));
        assert!(!third.is_resolved());
    }

    #[test]
    fn resume_without_pending_is_noop() {
        let suspender = Suspender::new();
        assert!(!suspender.resume());
        assert!(!suspender.is_suspended());
    }

    #[test]
    fn resume_wakes_every_waiter_once() {
        let suspender = Suspender::new();
        let mut a = suspender.suspend();
        let mut b = suspender.suspend();

        let counter_a = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let counter_b = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker_a = Waker::from(counter_a.clone());
        let waker_b = Waker::from(counter_b.clone());

        assert!(Pin::new(&mut a).poll(&mut Context::from_waker(&waker_a)).is_pending());
        // Polling twice with the same waker registers it once
        assert!(Pin::new(&mut a).poll(&mut Context::from_waker(&waker_a)).is_pending());
        assert!(Pin::new(&mut b).poll(&mut Context::from_waker(&waker_b)).is_pending());

        suspender.resume();

        assert_eq!(counter_a.0.load(Ordering::Relaxed), 1);
        assert_eq!(counter_b.0.load(Ordering::Relaxed), 1);
        assert!(Pin::new(&mut a).poll(&mut Context::from_waker(&waker_a)).is_ready());
        assert!(Pin::new(&mut b).poll(&mut Context::from_waker(&waker_b)).is_ready());
    }

    #[test]
    fn dropping_suspender_releases_waiters() {
        let suspender = Suspender::new();
        let token = suspender.suspend();
        drop(suspender);
        assert!(token.is_resolved());
    }
}
