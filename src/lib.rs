#![deny(missing_docs)]

//! Pull-based snapshot reads over push-based sources.
//!
//! A push source (a [`Subject`], a [`ShareReplay`] view, or anything that
//! implements [`Source`]) emits values over time. Consumers that evaluate
//! synchronously want the opposite shape: "give me the current value now, and
//! tell me when it changes". The stores in this crate bridge the two.
//!
//! # Quick Start
//!
//! ```ignore
//! use snapshot_store::{ExternalStore, LiveStore, SnapshotError, Subject};
//!
//! let counts = Subject::<u32, String>::new();
//! let store = LiveStore::new(counts.clone());
//!
//! // Nothing emitted yet: the read suspends instead of failing
//! match store.snapshot() {
//!     Err(SnapshotError::Suspended(token)) => { /* await token, then read again */ }
//!     _ => unreachable!(),
//! }
//!
//! let unsubscribe = store.subscribe(|| println!("changed"));
//! counts.next(1);
//! assert_eq!(store.snapshot().unwrap(), 1);
//! unsubscribe.dispose();
//! ```
//!
//! # Core Types
//!
//! - [`Suspender`] - Coalesces concurrent "not ready yet" reads onto one [`Suspension`].
//! - [`LiveStore`] - Keeps a live upstream subscription while anyone needs it.
//! - [`FetchOnceStore`] - Fills the cache with one shared fetch and keeps it.
//! - [`Store`] / [`StoreBuilder`] - Strategy chosen by [`RetentionPolicy`].
//! - [`Scheduler`] - Re-renders [`View`]s when stores change or suspensions complete.
//!
//! # Reading
//!
//! ```ignore
//! store.snapshot();        // Ok(value), Err(Source(e)) or Err(Suspended(token))
//! store.read().await;      // Retries across suspensions until a value or error
//! ```
//!
//! # Sources
//!
//! ```ignore
//! let subject = Subject::behavior(0);          // Replays its latest value
//! let shared = ShareReplay::new(subject);      // One upstream for many observers
//! let store = FetchOnceStore::from_shared(shared.clone());
//! ```

mod error;
mod listeners;
mod scheduler;
mod share;
mod source;
mod store;
mod subject;
mod suspender;

// Suspension
pub use suspender::{Suspender, Suspension};

// Push side
pub use share::ShareReplay;
pub use source::{FnObserver, Observer, Source, Subscription, observer};
pub use subject::Subject;

// Pull side
pub use error::SnapshotError;
pub use listeners::Unsubscribe;
pub use store::{
    ExternalStore, FetchOnceStore, LiveStore, Read, RetentionPolicy, Store, StoreBuilder,
    StoreState,
};

// Consumers
pub use scheduler::{Scheduler, View, ViewStatus};
