//! Observable state of one query site.

use std::fmt;
use std::sync::Arc;

use crate::error::FetchError;

/// Lifecycle position of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryStatus {
    /// Nothing fetched yet.
    #[default]
    Idle,
    /// An attempt is outstanding.
    Loading,
    /// The last settled attempt succeeded.
    Success,
    /// The last settled attempt failed.
    Failed,
}

/// Snapshot of a coordinator's state, as handed to views.
///
/// `data` is an immutable shared snapshot; a failed fetch leaves the previous
/// `data` in place next to `error`.
pub struct QueryState<T> {
    /// Last successfully fetched value, or `T::default()` before the first success.
    pub data: Arc<T>,
    /// Whether an attempt is outstanding.
    pub is_loading: bool,
    /// Last non-cancellation failure, cleared by the next success.
    pub error: Option<FetchError>,
    /// Lifecycle position.
    pub status: QueryStatus,
    /// Incremented on every state change. Compare with a stored revision to
    /// detect updates.
    pub revision: u64,
}

impl<T: Default> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: Arc::new(T::default()),
            is_loading: false,
            error: None,
            status: QueryStatus::Idle,
            revision: 0,
        }
    }
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            is_loading: self.is_loading,
            error: self.error.clone(),
            status: self.status,
            revision: self.revision,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for QueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryState")
            .field("data", &self.data)
            .field("is_loading", &self.is_loading)
            .field("error", &self.error)
            .field("status", &self.status)
            .field("revision", &self.revision)
            .finish()
    }
}

impl<T> QueryState<T> {
    /// Status to fall back to when an attempt ends without changing data or error.
    pub(crate) fn settled_status(&self, has_succeeded: bool) -> QueryStatus {
        if self.error.is_some() {
            QueryStatus::Failed
        } else if has_succeeded {
            QueryStatus::Success
        } else {
            QueryStatus::Idle
        }
    }
}
