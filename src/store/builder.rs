use super::{DEFAULT_LABEL, ExternalStore, FetchOnceStore, LiveStore, StoreState};
use crate::error::SnapshotError;
use crate::listeners::Unsubscribe;
use crate::share::ShareReplay;
use crate::source::Source;
use std::borrow::Cow;

/// Caching and retention strategy of a [`Store`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep a live upstream subscription while there is demand
    #[default]
    Live,
    /// Fill an empty cache with one shared fetch and keep the value
    FetchOnce,
}

/// Builder for configuring a [`Store`]
///
/// # Example
///
/// ```ignore
/// // Defaults: live policy, labelled "store"
/// let store = StoreBuilder::new(source).build();
///
/// // Custom configuration
/// let store = StoreBuilder::new(source)
///     .label("count")
///     .policy(RetentionPolicy::FetchOnce)
///     .keep_replay(true)
///     .build();
/// ```
pub struct StoreBuilder<S> {
    source: S,
    label: Cow<'static, str>,
    policy: RetentionPolicy,
    keep_replay: bool,
}

impl<S: Source> StoreBuilder<S> {
    /// Start configuring a store over `source`
    ///
    /// Defaults:
    /// - `label`: `"store"`
    /// - `policy`: [`RetentionPolicy::Live`]
    /// - `keep_replay`: false
    pub fn new(source: S) -> Self {
        Self {
            source,
            label: Cow::Borrowed(DEFAULT_LABEL),
            policy: RetentionPolicy::default(),
            keep_replay: false,
        }
    }

    /// Name the store in log events
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Select the retention strategy
    pub fn policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Keep the shared view's last value after all its observers left
    ///
    /// Only meaningful for [`RetentionPolicy::FetchOnce`].
    pub fn keep_replay(mut self, keep: bool) -> Self {
        self.keep_replay = keep;
        self
    }

    /// Build the configured store
    pub fn build(self) -> Store<S> {
        tracing::debug!(store = %self.label, policy = ?self.policy, "building store");
        match self.policy {
            RetentionPolicy::Live => Store::Live(LiveStore::with_label(self.source, self.label)),
            RetentionPolicy::FetchOnce => {
                let shared = ShareReplay::with_keep_replay(self.source, self.keep_replay);
                Store::FetchOnce(FetchOnceStore::with_label(shared, self.label))
            }
        }
    }
}

/// A store with its strategy chosen at runtime
pub enum Store<S: Source> {
    /// Always-subscribed strategy
    Live(LiveStore<S>),
    /// Fetch-once strategy
    FetchOnce(FetchOnceStore<S>),
}

impl<S: Source> Store<S> {
    /// Start configuring a store over `source`
    pub fn builder(source: S) -> StoreBuilder<S> {
        StoreBuilder::new(source)
    }

    /// The strategy this store runs
    pub fn policy(&self) -> RetentionPolicy {
        match self {
            Store::Live(_) => RetentionPolicy::Live,
            Store::FetchOnce(_) => RetentionPolicy::FetchOnce,
        }
    }

    /// Name used in log events
    pub fn label(&self) -> &str {
        match self {
            Store::Live(store) => store.label(),
            Store::FetchOnce(store) => store.label(),
        }
    }

    /// True while an upstream subscription is held
    pub fn is_subscribed(&self) -> bool {
        match self {
            Store::Live(store) => store.is_subscribed(),
            Store::FetchOnce(store) => store.is_subscribed(),
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        match self {
            Store::Live(store) => store.listener_count(),
            Store::FetchOnce(store) => store.listener_count(),
        }
    }

    /// Copy of the cached state
    pub fn state(&self) -> StoreState<S::Item, S::Error> {
        match self {
            Store::Live(store) => store.state(),
            Store::FetchOnce(store) => store.state(),
        }
    }

    /// The fetch-once strategy, if selected
    pub fn as_fetch_once(&self) -> Option<&FetchOnceStore<S>> {
        match self {
            Store::Live(_) => None,
            Store::FetchOnce(store) => Some(store),
        }
    }
}

impl<S: Source> ExternalStore for Store<S> {
    type Item = S::Item;
    type Error = S::Error;

    fn snapshot(&self) -> Result<S::Item, SnapshotError<S::Error>> {
        match self {
            Store::Live(store) => store.snapshot(),
            Store::FetchOnce(store) => store.snapshot(),
        }
    }

    fn subscribe<F>(&self, notifier: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        match self {
            Store::Live(store) => store.subscribe(notifier),
            Store::FetchOnce(store) => store.subscribe(notifier),
        }
    }
}
