//! Error side of a snapshot read.

use crate::suspender::Suspension;
use thiserror::Error;

/// Why [`snapshot()`](crate::ExternalStore::snapshot) did not return a value
///
/// "No value yet" and "the source failed" are kept apart: the first is a
/// cooperative suspension the caller retries after, the second is terminal for
/// the current subscription cycle.
#[derive(Debug, Clone, Error)]
pub enum SnapshotError<E> {
    /// Nothing cached yet; retry once the suspension completes
    #[error("no value has been emitted yet")]
    Suspended(Suspension),

    /// The source failed with this error
    #[error("source failed: {0}")]
    Source(E),
}

impl<E> SnapshotError<E> {
    /// True for the "not ready" case
    pub fn is_suspended(&self) -> bool {
        matches!(self, SnapshotError::Suspended(_))
    }

    /// The token to wait on, if this is a suspension
    pub fn suspension(&self) -> Option<&Suspension> {
        match self {
            SnapshotError::Suspended(token) => Some(token),
            SnapshotError::Source(_) => None,
        }
    }

    /// The source error, if this is one
    pub fn into_source(self) -> Option<E> {
        match self {
            SnapshotError::Suspended(_) => None,
            SnapshotError::Source(error) => Some(error),
        }
    }
}
