//! Tracer trait for observing coordinator execution.
//!
//! The default [`NoopTracer`] discards everything. [`LogTracer`] forwards
//! events to the `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use query_coord::{AttemptOutcome, Fingerprint, QueryCoordinator, Tracer};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_attempt_end(&self, attempt: u64, fingerprint: &Fingerprint, outcome: AttemptOutcome) {
//!         println!("#{attempt} {fingerprint}: {outcome:?}");
//!     }
//! }
//!
//! let users = QueryCoordinator::builder(GetUsers)
//!     .tracer(Arc::new(PrintTracer))
//!     .build(filter);
//! ```

use tracing::{debug, trace, warn};

use crate::fingerprint::Fingerprint;

/// How an attempt obtained the operation it waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptRole {
    /// Started a new fetch and published it to the registry.
    Started,
    /// Joined a fetch already in flight for the same fingerprint.
    Attached,
    /// Started a fetch that could not be published because the registry
    /// holds an entry of a different output type under the same fingerprint.
    Unpublished,
}

/// What a triggered attempt did to the coordinator's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptOutcome {
    /// The fetch succeeded and its value became `data`.
    Applied,
    /// The fetch failed and the error became `error`; `data` was kept.
    Failed,
    /// The fetch was cancelled while still the active attempt. State is
    /// untouched apart from leaving the loading flag.
    Cancelled,
    /// A newer attempt replaced this one before it settled; its outcome
    /// was discarded.
    Superseded,
    /// The coordinator was torn down before the outcome arrived.
    TornDown,
    /// Nothing to do: params unchanged since the last success, or already active.
    Skipped,
}

/// Tracer trait for observing coordinator execution.
///
/// All methods have empty default implementations. `attempt` is the
/// generation of the attempt within its coordinator, not a global id.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: events fire from spawned tasks.
pub trait Tracer: Send + Sync + 'static {
    /// Called when an attempt has claimed an operation.
    #[inline]
    fn on_attempt_start(&self, _attempt: u64, _fingerprint: &Fingerprint, _role: AttemptRole) {}

    /// Called when an attempt's outcome has been applied or discarded.
    #[inline]
    fn on_attempt_end(&self, _attempt: u64, _fingerprint: &Fingerprint, _outcome: AttemptOutcome) {}

    /// Called when a published operation settles and leaves the registry.
    #[inline]
    fn on_settle(&self, _fingerprint: &Fingerprint) {}

    /// Called when params could not be canonicalized.
    #[inline]
    fn on_degraded_fingerprint(&self, _fingerprint: &Fingerprint) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`QueryCoordinator`](crate::QueryCoordinator).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards events to the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_attempt_start(&self, attempt: u64, fingerprint: &Fingerprint, role: AttemptRole) {
        debug!(attempt, %fingerprint, ?role, "attempt started");
    }

    fn on_attempt_end(&self, attempt: u64, fingerprint: &Fingerprint, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Superseded | AttemptOutcome::TornDown => {
                trace!(attempt, %fingerprint, ?outcome, "attempt discarded")
            }
            _ => debug!(attempt, %fingerprint, ?outcome, "attempt finished"),
        }
    }

    fn on_settle(&self, fingerprint: &Fingerprint) {
        trace!(%fingerprint, "operation settled");
    }

    fn on_degraded_fingerprint(&self, fingerprint: &Fingerprint) {
        warn!(%fingerprint, "params not canonicalizable; requests may over-share");
    }
}
