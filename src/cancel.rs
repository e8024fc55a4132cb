//! Attempt generations and the cooperative cancellation helper.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Monotonic generation counter for one coordinator's attempts.
///
/// An attempt is authoritative iff its generation is still the coordinator's
/// current one; a late outcome from an older generation was superseded.
#[derive(Debug, Default)]
pub(crate) struct GenerationClock {
    next: AtomicU64,
}

impl GenerationClock {
    /// Returns the next generation, starting at 1.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }
}

/// Run `work` until it finishes or `token` is cancelled, whichever comes first.
///
/// Fetchers use this at their suspension points to turn a signaled token into
/// [`FetchError::Cancelled`]. Cancellation is checked before `work` is polled,
/// so an already-cancelled token never starts the work.
///
/// # Example
///
/// ```
/// use query_coord::{cancellable, FetchError};
/// use tokio_util::sync::CancellationToken;
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let token = CancellationToken::new();
/// token.cancel();
/// let result: Result<u32, FetchError> = cancellable(&token, async { Ok(1) }).await;
/// assert!(result.unwrap_err().is_cancelled());
/// # });
/// ```
pub async fn cancellable<T, F>(token: &CancellationToken, work: F) -> Result<T, FetchError>
where
    F: Future<Output = Result<T, FetchError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(FetchError::Cancelled),
        result = work => result,
    }
}
