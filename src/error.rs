//! Error types for fetch execution and fingerprinting.

use std::fmt;
use std::sync::Arc;

/// Outcome classification for a failed fetch.
///
/// Fetchers can propagate any error with the `?` operator: anything
/// implementing `Into<anyhow::Error>` converts into [`FetchError::Transport`].
/// Cancellation must be reported as [`FetchError::Cancelled`] so the
/// coordinator can tell a cancelled attempt from a real failure.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// The attempt's cancellation token was signaled.
    ///
    /// This happens when the attempt was superseded by a newer one or its
    /// owning coordinator was torn down. It is never recorded as a query error.
    Cancelled,

    /// Network, server or any other non-cancellation failure.
    ///
    /// The error is behind an `Arc` so one failure can be handed to every
    /// observer attached to the same in-flight operation.
    Transport(Arc<anyhow::Error>),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Cancelled => write!(f, "fetch cancelled"),
            FetchError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for FetchError {
    fn from(err: T) -> Self {
        FetchError::Transport(Arc::new(err.into()))
    }
}

impl FetchError {
    /// Returns `true` if this is the cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }

    /// Returns a reference to the inner transport error, if any.
    pub fn transport_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            FetchError::Transport(e) => Some(e),
            FetchError::Cancelled => None,
        }
    }

    /// Attempts to downcast the transport error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.transport_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a transport error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// The operation ended without producing a result (its task panicked
    /// or was never run).
    pub(crate) fn abandoned() -> Self {
        FetchError::Transport(Arc::new(anyhow::anyhow!("fetch ended without a result")))
    }
}

/// Params could not be turned into canonical text.
///
/// This never escapes fingerprinting; it downgrades the fingerprint instead.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalizeError {
    /// The params' `Serialize` impl failed or produced a shape JSON can't hold.
    #[error("params are not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}
