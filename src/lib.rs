#![deny(missing_docs)]
//! Query-Coord: shared, deduplicated, cancellable data loading.
//!
//! A [`QueryCoordinator`] turns a [`Fetcher`] plus params into the state a
//! view renders (`data`, `is_loading`, `error`). Coordinators that share an
//! [`InFlightRegistry`] never run the same request twice at once: a request
//! whose [`Fingerprint`] is already in flight is joined instead.
//!
//! # Key Features
//!
//! - **Deduplication**: identical `(fetcher, params)` requests share one fetch
//! - **Supersession**: changing params discards the outstanding attempt's result
//! - **Silent cancellation**: abandoned work never surfaces as an error
//! - **Forced refresh**: [`QueryCoordinator::refetch`] bypasses the unchanged-params guard
//! - **Stale data preservation**: a failed fetch keeps the last good `data`
//! - **Isolated registries**: registries are plain values, not globals
//!
//! # Example
//!
//! ```
//! use query_coord::{fetcher_fn, FetchError, InFlightRegistry, QueryCoordinator};
//! use serde_json::json;
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let registry = InFlightRegistry::new();
//! let users = fetcher_fn("get_users", |filter: serde_json::Value, _cancel| async move {
//!     Ok::<_, FetchError>(vec![format!("alice ({})", filter["status"])])
//! });
//!
//! let view = QueryCoordinator::new(&registry, users, json!({"status": "active"}));
//! view.activate().await;
//!
//! assert_eq!(view.data().len(), 1);
//! assert!(!view.is_loading());
//! assert!(registry.is_empty());
//! # });
//! ```

mod cancel;
mod coordinator;
mod error;
mod fetcher;
mod fingerprint;
mod registry;
mod state;
pub mod tracer;

pub use cancel::cancellable;
pub use coordinator::{AttemptHandle, CoordinatorBuilder, CoordinatorConfig, QueryCoordinator};
pub use error::{CanonicalizeError, FetchError};
pub use fetcher::{fetcher_fn, FnFetcher, Fetcher};
pub use fingerprint::{canonicalize, Fingerprint, UNSERIALIZABLE_MARKER};
pub use registry::InFlightRegistry;
pub use state::{QueryState, QueryStatus};
pub use tracer::{AttemptOutcome, AttemptRole, LogTracer, NoopTracer, Tracer};

// Fetchers receive this token type.
pub use tokio_util::sync::CancellationToken;
