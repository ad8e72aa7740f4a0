//! Middleware for sluice request slots.
//!
//! A middleware sees a slot twice: once at creation through
//! [`Middleware::setup`], where it registers hooks or wraps the executor, and
//! once per execution through [`Middleware::handle`], where it may wrap the
//! fetcher, serve a cached value, or stop the chain.
//!
//! Higher priority runs earlier. Equal priorities keep registration order.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `middleware-retry` | [`Retry`] with backoff |
//! | `middleware-swr` | [`Swr`] stale-while-revalidate cache |
//! | `middleware-gate` | [`Debounce`] and [`Throttle`] executors |
//! | `middleware-refresh` | [`Refresh`] polling and focus/reconnect refresh |
//! | `middleware-refresh-token` | [`RefreshToken`] single-flight token refresh |
//! | `middleware-full` | All of the above |
//!
//! # Built-in Middleware
//!
//! Every slot gets [`builtin`] middleware (ready, error, loading, single,
//! immediate) unless excluded with `ignore_middleware`. [`Logging`] is opt-in.
//!
//! # Example
//!
//! ```ignore
//! use sluice::middleware::{Retry, RetryCount, RetryOptions, from_fn};
//!
//! let options = RequestOptions::builder()
//!     .middleware(Retry::new(RetryOptions::new().count(RetryCount::Limited(3))))
//!     .middleware(from_fn(|ctx, next| next.run()).name("custom").priority(10));
//! ```

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sluice_core::{Data, Params, Result};

use crate::context::{BasicContext, Context};

pub mod builtin;
#[cfg(feature = "middleware-gate")]
mod gate;
mod logging;
mod pipeline;
#[cfg(feature = "middleware-refresh")]
mod refresh;
#[cfg(feature = "middleware-refresh-token")]
mod refresh_token;
#[cfg(feature = "middleware-retry")]
mod retry;
#[cfg(feature = "middleware-swr")]
mod swr;

#[cfg(feature = "middleware-gate")]
pub use gate::{Debounce, DebounceOptions, Throttle, ThrottleOptions};
pub use logging::{LogLevel, Logging};
pub use pipeline::{Next, Pipeline, Terminal};
#[cfg(feature = "middleware-refresh")]
pub use refresh::{PollingStatus, Refresh, RefreshOptions};
#[cfg(feature = "middleware-refresh-token")]
pub use refresh_token::{RefreshToken, RefreshTokenOptions};
#[cfg(feature = "middleware-retry")]
pub use retry::{Retry, RetryCount, RetryOptions, default_interval};
#[cfg(feature = "middleware-swr")]
pub use swr::{Swr, SwrOptions};

/// Priority of middleware that do not choose one.
pub const DEFAULT_PRIORITY: i32 = 1;

/// A request slot middleware.
pub trait Middleware<T: Data, P: Params>: Send + Sync + 'static {
    /// Unique name, used by `ignore_middleware`.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Higher priorities set up and handle first.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Called once when the slot is created.
    fn setup(&self, ctx: &BasicContext<T, P>) {
        let _ = ctx;
    }

    /// Called for every execution. The default continues the chain.
    fn handle(&self, ctx: Context<T, P>, next: Next<T, P>) -> BoxFuture<'static, Result<()>> {
        let _ = ctx;
        next.run()
    }
}

/// Order middleware for a slot.
///
/// Drops repeated `Arc`s, then sorts by descending priority. The sort is stable,
/// so equal priorities keep their registration order.
#[must_use]
pub fn normalize<T: Data, P: Params>(
    middleware: impl IntoIterator<Item = Arc<dyn Middleware<T, P>>>,
) -> Vec<Arc<dyn Middleware<T, P>>> {
    let mut normalized: Vec<Arc<dyn Middleware<T, P>>> = Vec::new();
    for candidate in middleware {
        if normalized.iter().any(|seen| Arc::ptr_eq(seen, &candidate)) {
            continue;
        }
        normalized.push(candidate);
    }
    normalized.sort_by_key(|middleware| std::cmp::Reverse(middleware.priority()));
    normalized
}

/// A middleware made of a handler closure.
///
/// Created with [`from_fn`].
pub struct FnMiddleware<F> {
    name: Option<String>,
    priority: i32,
    handler: F,
}

impl<F> std::fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl<F> FnMiddleware<F> {
    /// Set the middleware name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the middleware priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Wrap a handler closure into a middleware.
pub fn from_fn<F>(handler: F) -> FnMiddleware<F> {
    FnMiddleware {
        name: None,
        priority: DEFAULT_PRIORITY,
        handler,
    }
}

impl<T, P, F, Fut> Middleware<T, P> for FnMiddleware<F>
where
    T: Data,
    P: Params,
    F: Fn(Context<T, P>, Next<T, P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn handle(&self, ctx: Context<T, P>, next: Next<T, P>) -> BoxFuture<'static, Result<()>> {
        (self.handler)(ctx, next).boxed()
    }
}

/// Default options of every basic middleware.
///
/// Per-request option bags override these field by field.
#[derive(Debug, Clone, Default)]
pub struct BasicDefaults {
    /// Retry defaults.
    #[cfg(feature = "middleware-retry")]
    pub retry: RetryOptions,
    /// SWR defaults.
    #[cfg(feature = "middleware-swr")]
    pub swr: SwrOptions,
    /// Debounce defaults.
    #[cfg(feature = "middleware-gate")]
    pub debounce: DebounceOptions,
    /// Throttle defaults.
    #[cfg(feature = "middleware-gate")]
    pub throttle: ThrottleOptions,
    /// Refresh defaults.
    #[cfg(feature = "middleware-refresh")]
    pub refresh: RefreshOptions,
}

/// Build the standard basic middleware set.
///
/// Token refresh needs an expiry predicate and a handler, so it is added
/// separately with [`RefreshToken::new`].
#[must_use]
pub fn basic_middleware<T, P>(defaults: BasicDefaults) -> Vec<Arc<dyn Middleware<T, P>>>
where
    T: Data + serde::Serialize + serde::de::DeserializeOwned,
    P: Params,
{
    let _ = &defaults;
    let mut middleware: Vec<Arc<dyn Middleware<T, P>>> = Vec::new();
    #[cfg(feature = "middleware-swr")]
    middleware.push(Arc::new(Swr::new(defaults.swr)));
    #[cfg(feature = "middleware-retry")]
    middleware.push(Arc::new(Retry::new(defaults.retry)));
    #[cfg(feature = "middleware-refresh")]
    middleware.push(Arc::new(Refresh::new(defaults.refresh)));
    #[cfg(feature = "middleware-gate")]
    {
        middleware.push(Arc::new(Debounce::new(defaults.debounce)));
        middleware.push(Arc::new(Throttle::new(defaults.throttle)));
    }
    middleware
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, i32);

    impl Middleware<u32, ()> for Named {
        fn name(&self) -> Option<&str> {
            Some(self.0)
        }

        fn priority(&self) -> i32 {
            self.1
        }
    }

    fn names(middleware: &[Arc<dyn Middleware<u32, ()>>]) -> Vec<&str> {
        middleware.iter().filter_map(|m| m.name()).collect()
    }

    #[test]
    fn normalize_sorts_by_priority_and_keeps_order() {
        let list: Vec<Arc<dyn Middleware<u32, ()>>> = vec![
            Arc::new(Named("a", 1)),
            Arc::new(Named("b", 10)),
            Arc::new(Named("c", 1)),
            Arc::new(Named("d", -5)),
            Arc::new(Named("e", 10)),
        ];

        let normalized = normalize(list);
        assert_eq!(names(&normalized), vec!["b", "e", "a", "c", "d"]);
    }

    #[test]
    fn normalize_drops_duplicates() {
        let shared: Arc<dyn Middleware<u32, ()>> = Arc::new(Named("shared", 1));
        let list = vec![Arc::clone(&shared), Arc::new(Named("other", 1)), shared];

        let normalized = normalize(list);
        assert_eq!(names(&normalized), vec!["shared", "other"]);
    }

    #[test]
    fn pipeline_debug_lists_middleware_names() {
        let list: Vec<Arc<dyn Middleware<u32, ()>>> =
            vec![Arc::new(Named("first", 1)), Arc::new(Named("second", 0))];
        let pipeline = Pipeline::new(list);
        let debug = format!("{pipeline:?}");
        assert!(debug.contains("first"), "{debug}");
        assert!(debug.contains("second"), "{debug}");
    }

    #[test]
    fn fn_middleware_defaults() {
        let middleware = from_fn(|_ctx: Context<u32, ()>, next: Next<u32, ()>| next.run());
        assert_eq!(Middleware::<u32, ()>::name(&middleware), None);
        assert_eq!(Middleware::<u32, ()>::priority(&middleware), DEFAULT_PRIORITY);

        let middleware = middleware.name("custom").priority(42);
        assert_eq!(Middleware::<u32, ()>::name(&middleware), Some("custom"));
        assert_eq!(Middleware::<u32, ()>::priority(&middleware), 42);
    }
}
