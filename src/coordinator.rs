//! Query coordinator and its builder.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cancel::GenerationClock;
use crate::error::FetchError;
use crate::fetcher::Fetcher;
use crate::fingerprint::Fingerprint;
use crate::registry::{Claim, InFlightRegistry, SharedResult};
use crate::state::{QueryState, QueryStatus};
use crate::tracer::{AttemptOutcome, AttemptRole, NoopTracer, Tracer};

/// Tunables for a [`QueryCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How many times one attempt may claim again after the operation it was
    /// attached to got cancelled by the coordinator that started it.
    pub max_reattach: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { max_reattach: 3 }
    }
}

/// Stateful data loader for one query site.
///
/// A coordinator owns the state a view renders (`data`, `is_loading`,
/// `error`) and shares in-flight fetches with every other coordinator on the
/// same [`InFlightRegistry`]:
///
/// - an identical request already in flight is joined, not repeated;
/// - changing params supersedes the outstanding attempt, whose late outcome
///   is discarded;
/// - cancellation of superseded or torn-down work never shows up as `error`;
/// - [`refetch`](Self::refetch) forces a new attempt even when params are
///   unchanged.
///
/// Triggers are synchronous to call and return an [`AttemptHandle`]; the
/// attempt itself runs on a spawned Tokio task, so they must be called from
/// within a Tokio runtime.
///
/// Dropping the coordinator tears it down.
///
/// # Example
///
/// ```ignore
/// let registry = InFlightRegistry::new();
/// let users = QueryCoordinator::new(&registry, GetUsers::new(client), filter);
/// users.activate().await;
///
/// let state = users.snapshot();
/// render(&state.data, state.is_loading, state.error.as_ref());
/// ```
pub struct QueryCoordinator<F: Fetcher> {
    inner: Arc<Inner<F>>,
}

struct Inner<F: Fetcher> {
    fetcher: Arc<F>,
    identity: Cow<'static, str>,
    registry: InFlightRegistry,
    tracer: Arc<dyn Tracer>,
    config: CoordinatorConfig,
    clock: GenerationClock,
    local: Mutex<Local<F::Params>>,
    state: watch::Sender<QueryState<F::Output>>,
}

struct Local<P> {
    params: P,
    /// Fingerprint of the last attempt that succeeded.
    last_fingerprint: Option<Fingerprint>,
    /// Fingerprint of the active attempt while it is outstanding.
    pending: Option<Fingerprint>,
    /// Generation of the active attempt; 0 before the first one.
    generation: u64,
    /// Token of the last operation this coordinator started.
    token: Option<CancellationToken>,
    activated: bool,
    torn_down: bool,
}

impl<P> Local<P> {
    fn is_current(&self, generation: u64) -> bool {
        !self.torn_down && self.generation == generation
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Activate,
    ParamsChanged,
    Refetch,
}

impl<F: Fetcher> QueryCoordinator<F> {
    /// Create a coordinator on `registry` with default settings.
    ///
    /// Nothing is fetched until [`activate`](Self::activate),
    /// [`set_params`](Self::set_params) or [`refetch`](Self::refetch).
    pub fn new(registry: &InFlightRegistry, fetcher: F, params: F::Params) -> Self {
        Self::builder(fetcher).registry(registry).build(params)
    }

    /// Create a builder for customizing the coordinator.
    pub fn builder(fetcher: F) -> CoordinatorBuilder<F> {
        CoordinatorBuilder::new(fetcher)
    }

    /// Start the first fetch. Later calls are [`AttemptOutcome::Skipped`].
    pub fn activate(&self) -> AttemptHandle {
        self.begin(Trigger::Activate)
    }

    /// Replace the params and fetch if their fingerprint changed.
    ///
    /// Skipped when the new fingerprint matches the attempt already loading,
    /// or, with nothing loading, the last successful one. Otherwise the
    /// outstanding attempt (if any) is superseded.
    pub fn set_params(&self, params: F::Params) -> AttemptHandle {
        self.inner.local.lock().params = params;
        self.begin(Trigger::ParamsChanged)
    }

    /// Force a new attempt with the current params.
    ///
    /// Bypasses the unchanged-fingerprint check but still joins an identical
    /// request that is already in flight.
    pub fn refetch(&self) -> AttemptHandle {
        self.begin(Trigger::Refetch)
    }

    /// Signal the outstanding fetch this coordinator started and stop any
    /// later outcome from touching its state.
    ///
    /// Registry entries are left alone; they go away when their operation
    /// settles. Idempotent, and run automatically on drop.
    pub fn teardown(&self) {
        let mut local = self.inner.local.lock();
        if local.torn_down {
            return;
        }
        local.torn_down = true;
        local.pending = None;
        if let Some(token) = local.token.take() {
            token.cancel();
        }
        debug!(identity = %self.inner.identity, "coordinator torn down");
    }

    /// Whether [`teardown`](Self::teardown) has run.
    pub fn is_torn_down(&self) -> bool {
        self.inner.local.lock().torn_down
    }

    /// Current state.
    pub fn snapshot(&self) -> QueryState<F::Output> {
        self.inner.state.borrow().clone()
    }

    /// Last successfully fetched value, or the default before any success.
    pub fn data(&self) -> Arc<F::Output> {
        self.inner.state.borrow().data.clone()
    }

    /// Whether an attempt is outstanding.
    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    /// Last non-cancellation failure.
    pub fn error(&self) -> Option<FetchError> {
        self.inner.state.borrow().error.clone()
    }

    /// Lifecycle position.
    pub fn status(&self) -> QueryStatus {
        self.inner.state.borrow().status
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<F::Output>> {
        self.inner.state.subscribe()
    }

    /// Current params.
    pub fn params(&self) -> F::Params {
        self.inner.local.lock().params.clone()
    }

    /// Fingerprint of the current params.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.inner.identity, &self.inner.local.lock().params)
    }

    /// Fetcher identity used in fingerprints.
    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    /// Registry this coordinator shares fetches through.
    pub fn registry(&self) -> &InFlightRegistry {
        &self.inner.registry
    }

    fn begin(&self, trigger: Trigger) -> AttemptHandle {
        let inner = &self.inner;
        let mut local = inner.local.lock();
        if local.torn_down {
            return AttemptHandle::ready(AttemptOutcome::TornDown);
        }

        let fingerprint = Fingerprint::new(&inner.identity, &local.params);
        let skip = match trigger {
            Trigger::Activate => local.activated,
            Trigger::ParamsChanged => match &local.pending {
                Some(pending) => *pending == fingerprint,
                None => local.last_fingerprint.as_ref() == Some(&fingerprint),
            },
            Trigger::Refetch => false,
        };
        if skip {
            trace!(%fingerprint, ?trigger, "nothing to fetch");
            return AttemptHandle::ready(AttemptOutcome::Skipped);
        }
        if fingerprint.is_degraded() {
            inner.tracer.on_degraded_fingerprint(&fingerprint);
        }

        local.activated = true;
        let generation = inner.clock.next();
        local.generation = generation;
        local.pending = Some(fingerprint.clone());

        let params = local.params.clone();
        let (shared, role) = inner.claim(&fingerprint, generation, params.clone(), &mut local);
        inner.publish(|state| {
            state.is_loading = true;
            state.status = QueryStatus::Loading;
        });
        drop(local);

        let task = tokio::spawn(inner.clone().run_attempt(
            generation,
            fingerprint,
            params,
            shared,
            role,
        ));
        AttemptHandle::running(task)
    }
}

impl<F: Fetcher> Inner<F> {
    /// Attach to or start the operation for `fingerprint`.
    ///
    /// Runs with the local lock held and never suspends, so fingerprinting,
    /// the registry decision and publication form one uninterrupted step.
    fn claim(
        &self,
        fingerprint: &Fingerprint,
        generation: u64,
        params: F::Params,
        local: &mut Local<F::Params>,
    ) -> (SharedResult<F::Output>, AttemptRole) {
        let claim = self.registry.claim::<F::Output>(fingerprint, &self.tracer);
        let role = claim.role();
        self.tracer.on_attempt_start(generation, fingerprint, role);

        let shared = match claim {
            Claim::Attached(shared) => shared,
            Claim::Started(shared, launch) | Claim::Unpublished(shared, launch) => {
                let token = CancellationToken::new();
                if let Some(previous) = local.token.replace(token.clone()) {
                    previous.cancel();
                }
                let fetcher = self.fetcher.clone();
                tokio::spawn(launch.run(async move { fetcher.fetch(params, token).await }));
                shared
            }
        };
        (shared, role)
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        fingerprint: Fingerprint,
        params: F::Params,
        mut shared: SharedResult<F::Output>,
        mut role: AttemptRole,
    ) -> AttemptOutcome {
        let mut reattached = 0;
        loop {
            let result = shared.await;

            // Someone else's cancellation; we still want the data.
            if matches!(result, Err(FetchError::Cancelled)) && role == AttemptRole::Attached {
                let mut local = self.local.lock();
                if local.is_current(generation) && reattached < self.config.max_reattach {
                    reattached += 1;
                    debug!(
                        %fingerprint,
                        generation,
                        reattached,
                        "attached fetch was cancelled; claiming again"
                    );
                    (shared, role) =
                        self.claim(&fingerprint, generation, params.clone(), &mut local);
                    continue;
                }
            }

            let outcome = self.apply(generation, &fingerprint, result);
            self.tracer.on_attempt_end(generation, &fingerprint, outcome);
            return outcome;
        }
    }

    fn apply(
        &self,
        generation: u64,
        fingerprint: &Fingerprint,
        result: Result<Arc<F::Output>, FetchError>,
    ) -> AttemptOutcome {
        let mut local = self.local.lock();
        if local.torn_down {
            return AttemptOutcome::TornDown;
        }
        if local.generation != generation {
            trace!(
                %fingerprint,
                generation,
                current = local.generation,
                "discarding superseded outcome"
            );
            return AttemptOutcome::Superseded;
        }
        local.pending = None;

        match result {
            Ok(data) => {
                local.last_fingerprint = Some(fingerprint.clone());
                self.publish(|state| {
                    state.data = data;
                    state.error = None;
                    state.is_loading = false;
                    state.status = QueryStatus::Success;
                });
                AttemptOutcome::Applied
            }
            Err(FetchError::Cancelled) => {
                let has_succeeded = local.last_fingerprint.is_some();
                self.publish(|state| {
                    state.is_loading = false;
                    state.status = state.settled_status(has_succeeded);
                });
                AttemptOutcome::Cancelled
            }
            Err(error) => {
                debug!(%fingerprint, %error, "fetch failed; keeping previous data");
                self.publish(|state| {
                    state.error = Some(error);
                    state.is_loading = false;
                    state.status = QueryStatus::Failed;
                });
                AttemptOutcome::Failed
            }
        }
    }

    fn publish(&self, update: impl FnOnce(&mut QueryState<F::Output>)) {
        self.state.send_modify(|state| {
            update(state);
            state.revision += 1;
        });
    }
}

impl<F: Fetcher> Drop for QueryCoordinator<F> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<F: Fetcher> fmt::Debug for QueryCoordinator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("QueryCoordinator")
            .field("identity", &self.inner.identity)
            .field("status", &state.status)
            .field("is_loading", &state.is_loading)
            .field("revision", &state.revision)
            .finish()
    }
}

/// Completion of one triggered attempt.
///
/// Await it to learn what the attempt did; drop it to let the attempt run
/// unobserved.
pub struct AttemptHandle {
    state: HandleState,
}

enum HandleState {
    Ready(Option<AttemptOutcome>),
    Running(JoinHandle<AttemptOutcome>),
}

impl AttemptHandle {
    fn ready(outcome: AttemptOutcome) -> Self {
        Self {
            state: HandleState::Ready(Some(outcome)),
        }
    }

    fn running(task: JoinHandle<AttemptOutcome>) -> Self {
        Self {
            state: HandleState::Running(task),
        }
    }

    /// Whether the outcome is available without waiting.
    pub fn is_finished(&self) -> bool {
        match &self.state {
            HandleState::Ready(_) => true,
            HandleState::Running(task) => task.is_finished(),
        }
    }
}

impl Future for AttemptHandle {
    type Output = AttemptOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(AttemptOutcome::Skipped))
            }
            // The attempt task only fails to join when the runtime shuts down.
            HandleState::Running(task) => Pin::new(task)
                .poll(cx)
                .map(|joined| joined.unwrap_or(AttemptOutcome::TornDown)),
        }
    }
}

impl fmt::Debug for AttemptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Builder for [`QueryCoordinator`].
///
/// # Example
///
/// ```ignore
/// let coordinator = QueryCoordinator::builder(GetUsers)
///     .registry(&registry)
///     .tracer(Arc::new(LogTracer))
///     .max_reattach(1)
///     .build(filter);
/// ```
pub struct CoordinatorBuilder<F: Fetcher> {
    fetcher: F,
    registry: Option<InFlightRegistry>,
    tracer: Arc<dyn Tracer>,
    config: CoordinatorConfig,
}

impl<F: Fetcher> CoordinatorBuilder<F> {
    /// Create a builder with default settings.
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            registry: None,
            tracer: Arc::new(NoopTracer),
            config: CoordinatorConfig::default(),
        }
    }

    /// Share fetches through `registry`.
    ///
    /// Without this the coordinator gets a private registry and only
    /// deduplicates against itself.
    pub fn registry(mut self, registry: &InFlightRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    /// Observe attempts with `tracer`.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Replace all tunables.
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set [`CoordinatorConfig::max_reattach`].
    pub fn max_reattach(mut self, max_reattach: u32) -> Self {
        self.config.max_reattach = max_reattach;
        self
    }

    /// Build the coordinator with its initial params.
    pub fn build(self, params: F::Params) -> QueryCoordinator<F> {
        let identity = self.fetcher.identity();
        let (state, _) = watch::channel(QueryState::default());
        QueryCoordinator {
            inner: Arc::new(Inner {
                fetcher: Arc::new(self.fetcher),
                identity,
                registry: self.registry.unwrap_or_default(),
                tracer: self.tracer,
                config: self.config,
                clock: GenerationClock::default(),
                local: Mutex::new(Local {
                    params,
                    last_fingerprint: None,
                    pending: None,
                    generation: 0,
                    token: None,
                    activated: false,
                    torn_down: false,
                }),
                state,
            }),
        }
    }
}
