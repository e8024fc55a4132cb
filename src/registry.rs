//! Shared registry of in-flight fetch operations.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::fingerprint::Fingerprint;
use crate::tracer::{AttemptRole, Tracer};

/// Result of one fetch operation, clonable to every observer.
pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, Result<Arc<T>, FetchError>>>;

struct InFlight {
    op_id: u64,
    /// Type-erased `SharedResult<T>`.
    result: Arc<dyn Any + Send + Sync>,
}

struct RegistryInner {
    entries: Mutex<HashMap<Fingerprint, InFlight>>,
    next_op: AtomicU64,
}

/// Map from fingerprint to the operation currently fetching it.
///
/// Entries exist only while their operation is running: one is published when
/// a fetch starts and removed exactly once when it settles, whatever the
/// outcome. Completed results are never kept.
///
/// This is cheap to clone; clones share the same entries. Every coordinator
/// built on the same registry deduplicates against the others, and separate
/// registries are fully isolated.
#[derive(Clone)]
pub struct InFlightRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for InFlightRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The operation an attempt ended up waiting on.
///
/// `Started` and `Unpublished` carry the [`Launch`] that must be used to run
/// the fetch; dropping it unused settles the operation as abandoned.
pub(crate) enum Claim<T> {
    Started(SharedResult<T>, Launch<T>),
    Attached(SharedResult<T>),
    Unpublished(SharedResult<T>, Launch<T>),
}

impl<T> Claim<T> {
    pub fn role(&self) -> AttemptRole {
        match self {
            Claim::Started(..) => AttemptRole::Started,
            Claim::Attached(_) => AttemptRole::Attached,
            Claim::Unpublished(..) => AttemptRole::Unpublished,
        }
    }
}

impl InFlightRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_op: AtomicU64::new(1),
            }),
        }
    }

    /// Whether an operation for `fingerprint` is in flight.
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.entries.lock().contains_key(fingerprint)
    }

    /// Number of operations in flight.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Fingerprints of all operations in flight.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    /// Attach to the operation in flight for `fingerprint`, or publish a new one.
    ///
    /// Lookup and publication happen in one critical section without
    /// suspending, so two callers racing on the same fingerprint never both
    /// start. A published entry's result resolves once its [`Launch`] has
    /// run; the caller spawns that after this returns.
    pub(crate) fn claim<T>(&self, fingerprint: &Fingerprint, tracer: &Arc<dyn Tracer>) -> Claim<T>
    where
        T: Send + Sync + 'static,
    {
        let mut entries = self.inner.entries.lock();
        match entries.entry(fingerprint.clone()) {
            Entry::Occupied(e) => match e.get().result.downcast_ref::<SharedResult<T>>() {
                Some(shared) => {
                    debug!(%fingerprint, op_id = e.get().op_id, "attaching to in-flight fetch");
                    Claim::Attached(shared.clone())
                }
                None => {
                    warn!(
                        %fingerprint,
                        "in-flight fetch has a different output type; running unshared"
                    );
                    let guard = SettleGuard {
                        registry: None,
                        fingerprint: fingerprint.clone(),
                        op_id: 0,
                        tracer: tracer.clone(),
                    };
                    let (shared, launch) = pending(guard);
                    Claim::Unpublished(shared, launch)
                }
            },
            Entry::Vacant(e) => {
                let op_id = self.inner.next_op.fetch_add(1, Ordering::Relaxed);
                let guard = SettleGuard {
                    registry: Some(self.clone()),
                    fingerprint: fingerprint.clone(),
                    op_id,
                    tracer: tracer.clone(),
                };
                let (shared, launch) = pending(guard);
                e.insert(InFlight {
                    op_id,
                    result: Arc::new(shared.clone()),
                });
                debug!(%fingerprint, op_id, "published fetch");
                Claim::Started(shared, launch)
            }
        }
    }

    fn settle(&self, fingerprint: &Fingerprint, op_id: u64) -> bool {
        let mut entries = self.inner.entries.lock();
        match entries.get(fingerprint) {
            Some(entry) if entry.op_id == op_id => {
                entries.remove(fingerprint);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("in_flight", &self.fingerprints())
            .finish()
    }
}

fn pending<T: Send + Sync + 'static>(guard: SettleGuard) -> (SharedResult<T>, Launch<T>) {
    let (tx, rx) = oneshot::channel();
    let shared = rx
        .map(|received| received.unwrap_or_else(|_| Err(FetchError::abandoned())))
        .boxed()
        .shared();
    (shared, Launch { guard, tx })
}

/// The right (and duty) to run a claimed operation.
pub(crate) struct Launch<T> {
    guard: SettleGuard,
    tx: oneshot::Sender<Result<Arc<T>, FetchError>>,
}

impl<T> Launch<T> {
    /// Drive `work` to completion, settle the registry entry, then deliver
    /// the result to every observer.
    ///
    /// The entry is gone before any observer sees the result, so an observer
    /// reacting to it never attaches to the operation that just finished.
    pub async fn run<F>(self, work: F)
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        let Launch { guard, tx } = self;
        let result = work.await.map(Arc::new);
        drop(guard);
        let _ = tx.send(result);
    }
}

/// Removes a published operation from the registry when dropped.
///
/// Owned by the task running the operation, so removal happens when that task
/// ends for any reason: success, failure, cancellation, panic or abort.
pub(crate) struct SettleGuard {
    registry: Option<InFlightRegistry>,
    fingerprint: Fingerprint,
    op_id: u64,
    tracer: Arc<dyn Tracer>,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        if registry.settle(&self.fingerprint, self.op_id) {
            debug!(fingerprint = %self.fingerprint, op_id = self.op_id, "fetch settled");
            self.tracer.on_settle(&self.fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NoopTracer;

    fn noop() -> Arc<dyn Tracer> {
        Arc::new(NoopTracer)
    }

    fn result_of<T>(claim: Claim<T>) -> (SharedResult<T>, Option<Launch<T>>) {
        match claim {
            Claim::Started(r, l) | Claim::Unpublished(r, l) => (r, Some(l)),
            Claim::Attached(r) => (r, None),
        }
    }

    #[test]
    fn test_start_publishes_entry() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let claim = registry.claim::<u32>(&fp, &noop());
        assert_eq!(claim.role(), AttemptRole::Started);
        assert!(registry.contains(&fp));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.fingerprints(), vec![fp]);
    }

    #[test]
    fn test_second_claim_attaches() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let first = registry.claim::<u32>(&fp, &noop());
        let second = registry.claim::<u32>(&fp, &noop());

        assert_eq!(first.role(), AttemptRole::Started);
        assert_eq!(second.role(), AttemptRole::Attached);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_run_settles_before_delivering() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let (started, launch) = result_of(registry.claim::<u32>(&fp, &noop()));
        let (attached, none) = result_of(registry.claim::<u32>(&fp, &noop()));
        assert!(none.is_none());

        let launch = launch.unwrap();
        tokio::spawn(launch.run(async { Ok::<u32, FetchError>(3) }));

        assert_eq!(*started.await.unwrap(), 3);
        assert!(registry.is_empty());
        assert_eq!(*attached.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unused_launch_settles_as_abandoned() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let (result, launch) = result_of(registry.claim::<u32>(&fp, &noop()));
        drop(launch);

        assert!(!registry.contains(&fp));
        let err = result.await.unwrap_err();
        assert!(!err.is_cancelled());
    }

    #[tokio::test]
    async fn test_failure_is_shared() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let (first, launch) = result_of(registry.claim::<u32>(&fp, &noop()));
        let (second, _) = result_of(registry.claim::<u32>(&fp, &noop()));
        launch
            .unwrap()
            .run(async { Err::<u32, _>(FetchError::from(anyhow::anyhow!("502"))) })
            .await;

        assert!(first.await.unwrap_err().to_string().contains("502"));
        assert!(second.await.unwrap_err().to_string().contains("502"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_guard_does_not_remove_newer_entry() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let (_old, old_launch) = result_of(registry.claim::<u32>(&fp, &noop()));
        // The old operation's entry is gone and a new one took the slot.
        assert!(registry.settle(&fp, 1));
        let (_new, _new_launch) = result_of(registry.claim::<u32>(&fp, &noop()));

        drop(old_launch);
        assert!(registry.contains(&fp));
    }

    #[test]
    fn test_type_mismatch_runs_unpublished() {
        let registry = InFlightRegistry::new();
        let fp = Fingerprint::new("collide", &());

        let _numbers = registry.claim::<u32>(&fp, &noop());
        let words = registry.claim::<String>(&fp, &noop());
        assert_eq!(words.role(), AttemptRole::Unpublished);

        drop(words);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = InFlightRegistry::new();
        let clone = registry.clone();
        let isolated = InFlightRegistry::new();
        let fp = Fingerprint::new("users", &());

        let _claim = registry.claim::<u32>(&fp, &noop());

        assert!(clone.contains(&fp));
        assert!(!isolated.contains(&fp));
    }
}
