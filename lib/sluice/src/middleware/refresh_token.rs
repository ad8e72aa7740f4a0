//! Token refresh middleware.
//!
//! When a fetch fails with an error the `expired` predicate recognises, the
//! middleware runs the refresh `handler` once for every slot of the runtime,
//! waits for it, and replays the fetch. Fetches that start while a refresh is
//! in flight wait for it before they are sent.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sluice_core::{Data, Error, Fetcher, Params, Result};
use tracing::{debug, trace, warn};

use super::{Middleware, Next};
use crate::context::{Context, WeakContext};
use crate::runtime::{Runtime, SharedRefresh};

type AllowFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type ExpiredFn = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type HandlerFn<T, P> = Arc<dyn Fn(Context<T, P>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Per-request options of the [`RefreshToken`] middleware.
#[derive(Clone, Default)]
pub struct RefreshTokenOptions {
    allow: Option<AllowFn>,
}

impl std::fmt::Debug for RefreshTokenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshTokenOptions")
            .field("allow", &self.allow.is_some())
            .finish()
    }
}

impl RefreshTokenOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the request with the given key may refresh the token.
    #[must_use]
    pub fn allow(mut self, allow: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.allow = Some(Arc::new(allow));
        self
    }
}

/// Single-flight token refresh middleware.
///
/// # Example
///
/// ```ignore
/// use sluice::middleware::RefreshToken;
///
/// let refresh = RefreshToken::new(Error::is_unauthorized, |ctx| async move {
///     renew_token().await
/// });
/// ```
pub struct RefreshToken<T, P> {
    allow: Option<AllowFn>,
    expired: ExpiredFn,
    handler: HandlerFn<T, P>,
}

impl<T, P> Clone for RefreshToken<T, P> {
    fn clone(&self) -> Self {
        Self {
            allow: self.allow.clone(),
            expired: Arc::clone(&self.expired),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T, P> std::fmt::Debug for RefreshToken<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshToken")
            .field("allow", &self.allow.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> RefreshToken<T, P> {
    /// Refresh with `handler` whenever `expired` accepts a fetch error.
    pub fn new<E, H, Fut>(expired: E, handler: H) -> Self
    where
        E: Fn(&Error) -> bool + Send + Sync + 'static,
        H: Fn(Context<T, P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            allow: None,
            expired: Arc::new(expired),
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }

    /// Default `allow` predicate, overridden by [`RefreshTokenOptions`].
    #[must_use]
    pub fn allow(mut self, allow: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.allow = Some(Arc::new(allow));
        self
    }
}

impl<T: Data, P: Params> Middleware<T, P> for RefreshToken<T, P> {
    fn name(&self) -> Option<&str> {
        Some("basic:refresh-token")
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn handle(&self, ctx: Context<T, P>, next: Next<T, P>) -> BoxFuture<'static, Result<()>> {
        let allow = ctx
            .options()
            .get::<RefreshTokenOptions>()
            .and_then(|options| options.allow.clone())
            .or_else(|| self.allow.clone());
        if allow.is_none_or(|allow| allow(ctx.key())) {
            let inner = ctx.fetcher();
            let weak = ctx.downgrade();
            let expired = Arc::clone(&self.expired);
            let handler = Arc::clone(&self.handler);
            ctx.set_fetcher(Fetcher::new(move |params: P| {
                fetch_with_refresh(
                    inner.clone(),
                    weak.clone(),
                    Arc::clone(&expired),
                    Arc::clone(&handler),
                    params,
                )
            }));
        }
        next.run()
    }
}

/// Clears the runtime's in-flight marker when the refreshing fetch ends,
/// including when its future is dropped mid-refresh.
struct InFlight {
    runtime: Runtime,
    refresh: SharedRefresh,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.runtime.finish_refresh(&self.refresh);
    }
}

async fn fetch_with_refresh<T: Data, P: Params>(
    fetcher: Fetcher<T, P>,
    weak: WeakContext<T, P>,
    expired: ExpiredFn,
    handler: HandlerFn<T, P>,
    params: P,
) -> Result<T> {
    let Some(ctx) = weak.upgrade() else {
        return fetcher.call(params).await;
    };
    let runtime = ctx.runtime().clone();

    if let Some(refresh) = runtime.refresh_in_flight() {
        if refresh.peek().is_none() {
            trace!(key = %ctx.key(), "waiting for the token refresh in flight");
            refresh.await?;
            return fetcher.call(params).await;
        }
        runtime.finish_refresh(&refresh);
    }

    let error = match fetcher.call(params.clone()).await {
        Ok(data) => match ctx.options().data_parser.call(data.clone()).await {
            Ok(_) => return Ok(data),
            Err(error) => error,
        },
        Err(error) => error,
    };
    if !expired(&error) {
        return Err(error);
    }

    debug!(key = %ctx.key(), %error, "token expired, refreshing");
    let refresh = runtime.refresh_or_start(|| handler(ctx.clone()).shared());
    let in_flight = InFlight {
        runtime: runtime.clone(),
        refresh: refresh.clone(),
    };
    let outcome = refresh.await;
    drop(in_flight);
    if let Err(refresh_error) = outcome {
        warn!(key = %ctx.key(), error = %refresh_error, "token refresh failed");
        return Err(error);
    }

    fetcher.call(params).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::engine::{Engine, Request};
    use crate::options::RequestOptions;

    #[derive(Clone, Default)]
    struct Auth {
        valid: Arc<AtomicBool>,
        fetches: Arc<AtomicU32>,
        refreshes: Arc<AtomicU32>,
    }

    impl Auth {
        fn fetcher(&self, value: u32) -> Fetcher<u32, ()> {
            let auth = self.clone();
            Fetcher::new(move |()| {
                auth.fetches.fetch_add(1, Ordering::SeqCst);
                let valid = auth.valid.load(Ordering::SeqCst);
                async move {
                    if valid {
                        Ok(value)
                    } else {
                        Err(Error::http(401, "token expired"))
                    }
                }
            })
        }

        fn middleware(&self, outcome: Result<()>) -> RefreshToken<u32, ()> {
            let auth = self.clone();
            RefreshToken::new(Error::is_unauthorized, move |_ctx| {
                let auth = auth.clone();
                let outcome = outcome.clone();
                async move {
                    auth.refreshes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if outcome.is_ok() {
                        auth.valid.store(true, Ordering::SeqCst);
                    }
                    outcome
                }
            })
        }

        fn request(&self, engine: &Engine<u32, ()>, value: u32, middleware: RefreshToken<u32, ()>) -> Request<u32, ()> {
            engine.request(self.fetcher(value), RequestOptions::builder().middleware(middleware))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_is_refreshed_and_replayed() {
        let auth = Auth::default();
        let engine = Engine::default();
        let request = auth.request(&engine, 42, auth.middleware(Ok(())));

        let data = request.run(()).await.expect("run");

        assert_eq!(data, Some(42));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(auth.fetches.load(Ordering::SeqCst), 2);
        assert!(request.state().error.is_none());
        assert!(engine.runtime().refresh_in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn one_refresh_for_every_slot() {
        let auth = Auth::default();
        let engine = Engine::default();
        let middleware = auth.middleware(Ok(()));
        let first = auth.request(&engine, 1, middleware.clone());
        let second = auth.request(&engine, 2, middleware);

        let (a, b) = tokio::join!(first.run(()), second.run(()));

        assert_eq!(a.expect("first"), Some(1));
        assert_eq!(b.expect("second"), Some(2));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_pass_through() {
        let auth = Auth::default();
        let engine = Engine::default();
        let request = engine.request(
            Fetcher::new(|()| async { Err::<u32, _>(Error::http(500, "down")) }),
            RequestOptions::builder().middleware(auth.middleware(Ok(()))),
        );

        assert_eq!(request.run(()).await, Err(Error::http(500, "down")));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_surfaces_the_original_error() {
        let auth = Auth::default();
        let engine = Engine::default();
        let request = auth.request(&engine, 42, auth.middleware(Err(Error::fetch("refresh rejected"))));

        assert_eq!(request.run(()).await, Err(Error::http(401, "token expired")));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert!(engine.runtime().refresh_in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_error_surfaces_when_the_retried_fetch_fails() {
        let auth = Auth::default();
        let engine = Engine::default();
        let state = auth.clone();
        let request = engine.request(
            Fetcher::new(move |()| {
                let valid = state.valid.load(Ordering::SeqCst);
                async move {
                    if valid {
                        Err::<u32, _>(Error::http(500, "replay rejected"))
                    } else {
                        Err(Error::http(401, "token expired"))
                    }
                }
            }),
            RequestOptions::builder().middleware(auth.middleware(Ok(()))),
        );

        assert_eq!(request.run(()).await, Err(Error::http(500, "replay rejected")));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(request.state().error, Some(Error::http(500, "replay rejected")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_refresh_does_not_block_later_refreshes() {
        let auth = Auth::default();
        let engine = Engine::default();
        let request = auth.request(&engine, 7, auth.middleware(Ok(())));

        let running = tokio::spawn(request.context().run(()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.runtime().refresh_in_flight().is_some());
        request.cancel();
        running.await.expect("join").expect("cancelled run");
        assert!(engine.runtime().refresh_in_flight().is_none());

        assert_eq!(request.run(()).await, Ok(Some(7)));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 2);

        auth.valid.store(false, Ordering::SeqCst);
        assert_eq!(request.run(()).await, Ok(Some(7)));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 3);
        assert!(engine.runtime().refresh_in_flight().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn requests_can_opt_out() {
        let auth = Auth::default();
        let engine = Engine::default();
        let request = engine.request(
            auth.fetcher(42),
            RequestOptions::builder()
                .middleware(auth.middleware(Ok(())))
                .with(RefreshTokenOptions::new().allow(|_key| false)),
        );

        assert_eq!(request.run(()).await, Err(Error::http(401, "token expired")));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 0);
    }
}
