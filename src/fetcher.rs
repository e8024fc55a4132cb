//! Fetcher trait definition.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// An operation that loads data for a set of params.
///
/// The fetcher's [`identity`](Fetcher::identity) together with its params
/// forms the [`Fingerprint`](crate::Fingerprint) used to share in-flight
/// requests between coordinators.
///
/// # Cancellation
///
/// `fetch` receives a token that is cancelled when the attempt is superseded
/// or its coordinator is torn down. Implementations should observe it at their
/// suspension points (see [`cancellable`](crate::cancellable)) and return
/// [`FetchError::Cancelled`]. Any other error is treated as a real failure.
///
/// # Example
///
/// ```ignore
/// use query_coord::{Fetcher, FetchError};
/// use tokio_util::sync::CancellationToken;
///
/// struct GetUsers { client: HttpClient }
///
/// #[async_trait::async_trait]
/// impl Fetcher for GetUsers {
///     type Params = UserFilter;
///     type Output = Vec<User>;
///
///     async fn fetch(
///         &self,
///         params: UserFilter,
///         cancel: CancellationToken,
///     ) -> Result<Vec<User>, FetchError> {
///         query_coord::cancellable(&cancel, self.client.users(params)).await
///     }
/// }
/// ```
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Parameters of one request. Only used through serialization for
    /// fingerprinting, and handed to [`fetch`](Fetcher::fetch) by value.
    type Params: Serialize + Clone + Send + Sync + 'static;

    /// Loaded value. `Default` is the value observers see before the first
    /// successful fetch.
    type Output: Default + Send + Sync + 'static;

    /// Name identifying this operation in fingerprints.
    ///
    /// Defaults to the implementing type's path, which is distinct for every
    /// type. Override it to share in-flight requests between different types
    /// that perform the same operation.
    fn identity(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }

    /// Perform the request.
    async fn fetch(
        &self,
        params: Self::Params,
        cancel: CancellationToken,
    ) -> Result<Self::Output, FetchError>;
}

/// Closure-backed [`Fetcher`] created by [`fetcher_fn`].
pub struct FnFetcher<P, O, Func> {
    name: Cow<'static, str>,
    func: Func,
    _marker: PhantomData<fn(P) -> O>,
}

/// Wrap a closure as a [`Fetcher`] under an explicit identity.
///
/// Closures have no stable name of their own, so the caller picks one. Two
/// closures given the same name and equal params share in-flight requests.
///
/// # Example
///
/// ```
/// use query_coord::{fetcher_fn, FetchError, Fetcher};
///
/// let users = fetcher_fn("get_users", |status: String, _cancel| async move {
///     Ok::<_, FetchError>(vec![format!("user ({status})")])
/// });
/// assert_eq!(users.identity(), "get_users");
/// ```
pub fn fetcher_fn<P, O, Func, Fut>(
    name: impl Into<Cow<'static, str>>,
    func: Func,
) -> FnFetcher<P, O, Func>
where
    Func: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, FetchError>> + Send + 'static,
{
    FnFetcher {
        name: name.into(),
        func,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<P, O, Func, Fut> Fetcher for FnFetcher<P, O, Func>
where
    P: Serialize + Clone + Send + Sync + 'static,
    O: Default + Send + Sync + 'static,
    Func: Fn(P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, FetchError>> + Send + 'static,
{
    type Params = P;
    type Output = O;

    fn identity(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    async fn fetch(&self, params: P, cancel: CancellationToken) -> Result<O, FetchError> {
        (self.func)(params, cancel).await
    }
}

impl<P, O, Func> fmt::Debug for FnFetcher<P, O, Func> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFetcher").field("name", &self.name).finish()
    }
}
