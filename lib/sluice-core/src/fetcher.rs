//! Function types threaded through an execution.
//!
//! All three are cheap to clone `Arc`s around a boxed closure, so middleware
//! can wrap one and store the wrapper back into the context.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::Result;

type FetchFn<T, P> = dyn Fn(P) -> BoxFuture<'static, Result<T>> + Send + Sync;
type ExecuteFn<P> = dyn Fn(P) -> BoxFuture<'static, Result<()>> + Send + Sync;
type ParseFn<T> = dyn Fn(T) -> BoxFuture<'static, Result<T>> + Send + Sync;

/// The caller-supplied fetch function: parameters in, raw data out.
pub struct Fetcher<T, P> {
    inner: Arc<FetchFn<T, P>>,
}

impl<T, P> Clone for Fetcher<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, P> std::fmt::Debug for Fetcher<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").finish_non_exhaustive()
    }
}

impl<T, P> Fetcher<T, P>
where
    T: 'static,
    P: 'static,
{
    /// Wrap an async closure.
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |params| fetch(params).boxed()),
        }
    }

    /// Invoke the fetcher.
    pub fn call(&self, params: P) -> BoxFuture<'static, Result<T>> {
        (self.inner)(params)
    }
}

/// The indirection `run()` goes through before an execution starts.
///
/// Gating middleware (debounce, throttle) replace it to decide whether an
/// execution happens at all.
pub struct Executor<P> {
    inner: Arc<ExecuteFn<P>>,
}

impl<P> Clone for Executor<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for Executor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

impl<P: 'static> Executor<P> {
    /// Wrap an async closure.
    pub fn new<F, Fut>(execute: F) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |params| execute(params).boxed()),
        }
    }

    /// Invoke the executor.
    pub fn call(&self, params: P) -> BoxFuture<'static, Result<()>> {
        (self.inner)(params)
    }
}

/// Async transformation applied to every raw fetch result.
pub struct DataParser<T> {
    inner: Arc<ParseFn<T>>,
}

impl<T> Clone for DataParser<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for DataParser<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataParser").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Default for DataParser<T> {
    fn default() -> Self {
        Self::identity()
    }
}

impl<T: Send + 'static> DataParser<T> {
    /// Wrap an async closure.
    pub fn new<F, Fut>(parse: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |raw| parse(raw).boxed()),
        }
    }

    /// Wrap a synchronous, fallible closure.
    pub fn from_fn(parse: impl Fn(T) -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(move |raw| futures_util::future::ready(parse(raw)).boxed()),
        }
    }

    /// The parser that returns its input unchanged.
    #[must_use]
    pub fn identity() -> Self {
        Self::from_fn(Ok)
    }

    /// Parse a raw value.
    pub fn call(&self, raw: T) -> BoxFuture<'static, Result<T>> {
        (self.inner)(raw)
    }
}
