//! Retry middleware.
//!
//! Wraps the fetcher of each execution so failed fetches, and fetched data the
//! parser rejects, are retried with a backoff.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use sluice_core::{Data, Error, Fetcher, Params, Result, StatePatch};
use tracing::debug;

use super::{Middleware, Next};
use crate::context::{Context, WeakContext};

type AllowFn = Arc<dyn Fn(&Error, &str) -> bool + Send + Sync>;
type IntervalFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Longest wait between two attempts with the default interval.
pub const MAX_DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Default wait before retry `attempt` (1-based): `2^attempt` seconds, capped
/// at 30 seconds.
#[must_use]
pub fn default_interval(attempt: u32) -> Duration {
    Duration::from_secs(2_u64.saturating_pow(attempt)).min(MAX_DEFAULT_INTERVAL)
}

/// How many retries an execution may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCount {
    /// At most this many retries. `Limited(0)` disables retrying.
    Limited(u32),
    /// Retry until an attempt succeeds or the execution is cancelled.
    Unlimited,
}

impl RetryCount {
    /// Retrying disabled.
    pub const NONE: Self = Self::Limited(0);

    fn allows(self, done: u32) -> bool {
        match self {
            Self::Limited(max) => done < max,
            Self::Unlimited => true,
        }
    }
}

/// Options of the [`Retry`] middleware.
///
/// Attach to a request with `RequestOptions::builder().with(options)`; unset
/// fields fall back to the middleware defaults.
///
/// # Example
///
/// ```ignore
/// use sluice::middleware::{RetryCount, RetryOptions};
///
/// let options = RetryOptions::new()
///     .count(RetryCount::Limited(3))
///     .allow(|err, _key| err.is_server_error())
///     .interval(|_| Duration::from_millis(500));
/// ```
#[derive(Clone, Default)]
pub struct RetryOptions {
    count: Option<RetryCount>,
    allow: Option<AllowFn>,
    interval: Option<IntervalFn>,
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("count", &self.count)
            .field("allow", &self.allow.is_some())
            .field("interval", &self.interval.is_some())
            .finish()
    }
}

impl RetryOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget.
    #[must_use]
    pub fn count(mut self, count: RetryCount) -> Self {
        self.count = Some(count);
        self
    }

    /// Only retry errors for which `allow(error, key)` is true.
    #[must_use]
    pub fn allow(mut self, allow: impl Fn(&Error, &str) -> bool + Send + Sync + 'static) -> Self {
        self.allow = Some(Arc::new(allow));
        self
    }

    /// Wait `interval(attempt)` before retry `attempt` (1-based).
    #[must_use]
    pub fn interval(mut self, interval: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.interval = Some(Arc::new(interval));
        self
    }

    /// The configured retry budget, if set.
    #[must_use]
    pub fn get_count(&self) -> Option<RetryCount> {
        self.count
    }

    /// Overlay `other` on `self`; fields set in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            count: other.count.or(self.count),
            allow: other.allow.or(self.allow),
            interval: other.interval.or(self.interval),
        }
    }
}

#[derive(Clone)]
struct Policy {
    count: RetryCount,
    allow: Option<AllowFn>,
    interval: Option<IntervalFn>,
}

impl Policy {
    fn resolve(options: RetryOptions) -> Self {
        Self {
            count: options.count.unwrap_or(RetryCount::NONE),
            allow: options.allow,
            interval: options.interval,
        }
    }

    fn allows(&self, error: &Error, key: &str) -> bool {
        self.allow.as_ref().is_none_or(|allow| allow(error, key))
    }

    fn wait(&self, attempt: u32) -> Duration {
        self.interval
            .as_ref()
            .map_or_else(|| default_interval(attempt), |interval| interval(attempt))
    }
}

/// Middleware retrying failed fetches.
///
/// Each attempt runs the fetcher and then the data parser, so validation
/// failures are retried like transport failures. Between attempts it fires
/// `retry_progress` and `error`, then waits for the interval unless the
/// execution is cancelled. It ends with `retry_success`, clearing the error
/// the retries left in the state, or `retry_fail`.
#[derive(Debug, Clone, Default)]
pub struct Retry {
    defaults: RetryOptions,
}

impl Retry {
    /// Create the middleware with default options.
    #[must_use]
    pub fn new(defaults: RetryOptions) -> Self {
        Self { defaults }
    }
}

impl<T: Data, P: Params> Middleware<T, P> for Retry {
    fn name(&self) -> Option<&str> {
        Some("basic:retry")
    }

    fn priority(&self) -> i32 {
        900
    }

    fn handle(&self, ctx: Context<T, P>, next: Next<T, P>) -> BoxFuture<'static, Result<()>> {
        let bag = ctx.options().get::<RetryOptions>().cloned().unwrap_or_default();
        let policy = Policy::resolve(self.defaults.clone().merge(bag));
        if policy.count == RetryCount::NONE {
            return next.run();
        }

        let inner = ctx.fetcher();
        let weak = ctx.downgrade();
        ctx.set_fetcher(Fetcher::new(move |params: P| {
            fetch_with_retry(inner.clone(), weak.clone(), policy.clone(), params)
        }));
        next.run()
    }
}

async fn attempt<T: Data, P: Params>(fetcher: &Fetcher<T, P>, ctx: &Context<T, P>, params: P) -> Result<T> {
    let data = fetcher.call(params).await?;
    ctx.options().data_parser.call(data.clone()).await?;
    Ok(data)
}

async fn fetch_with_retry<T: Data, P: Params>(
    fetcher: Fetcher<T, P>,
    weak: WeakContext<T, P>,
    policy: Policy,
    params: P,
) -> Result<T> {
    let Some(ctx) = weak.upgrade() else {
        return fetcher.call(params).await;
    };

    let mut result = attempt(&fetcher, &ctx, params.clone()).await;
    match &result {
        Ok(_) => return result,
        Err(error) if !policy.allows(error, ctx.key()) => return result,
        Err(_) => {}
    }

    let mut retries = 0;
    while let Err(error) = &result {
        if ctx.is_cancelled() || !policy.count.allows(retries) {
            break;
        }
        retries += 1;
        debug!(key = %ctx.key(), execution = ctx.id(), attempt = retries, %error, "retrying");

        ctx.hooks().retry_progress.call_serial((retries, ctx.clone())).await?;
        ctx.hooks().error.call_serial((error.clone(), ctx.clone())).await?;

        tokio::select! {
            biased;
            () = ctx.cancelled() => break,
            () = tokio::time::sleep(policy.wait(retries)) => {}
        }
        result = attempt(&fetcher, &ctx, params.clone()).await;
    }

    match &result {
        Ok(data) => {
            ctx.mutate_state(StatePatch::new().error(None));
            ctx.hooks().retry_success.call_serial((data.clone(), ctx.clone())).await?;
        }
        Err(error) => ctx.hooks().retry_fail.call_serial((error.clone(), ctx.clone())).await?,
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use sluice_core::lock;
    use tokio::time::Instant;

    use super::*;
    use crate::engine::{Engine, Request};
    use crate::options::{RequestOptions, RequestOptionsBuilder};

    fn flaky(failures: u32, calls: &Arc<AtomicU32>) -> Fetcher<u32, u32> {
        let calls = Arc::clone(calls);
        Fetcher::new(move |n: u32| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < failures {
                    Err(Error::http(503, "unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
    }

    fn request(fetcher: Fetcher<u32, u32>, options: RequestOptionsBuilder<u32, u32>) -> Request<u32, u32> {
        let engine: Engine<u32, u32> = Engine::default();
        engine.request(fetcher, options.middleware(Retry::default()))
    }

    #[test]
    fn default_interval_backs_off_to_a_cap() {
        assert_eq!(default_interval(1), Duration::from_secs(2));
        assert_eq!(default_interval(2), Duration::from_secs(4));
        assert_eq!(default_interval(4), Duration::from_secs(16));
        assert_eq!(default_interval(5), MAX_DEFAULT_INTERVAL);
        assert_eq!(default_interval(u32::MAX), MAX_DEFAULT_INTERVAL);

        let waits: Vec<Duration> = (0..40).map(default_interval).collect();
        assert!(waits.windows(2).all(|pair| matches!(pair, [a, b] if a <= b)));
    }

    #[test]
    fn options_merge_field_by_field() {
        let defaults = RetryOptions::new().count(RetryCount::Limited(5));
        let merged = defaults.merge(RetryOptions::new().interval(|_| Duration::ZERO));
        assert_eq!(merged.get_count(), Some(RetryCount::Limited(5)));
        assert!(merged.interval.is_some());

        let merged = merged.merge(RetryOptions::new().count(RetryCount::Unlimited));
        assert_eq!(merged.get_count(), Some(RetryCount::Unlimited));
    }

    #[tokio::test]
    async fn disabled_by_default() {
        let calls = Arc::new(AtomicU32::new(0));
        let request = request(flaky(1, &calls), RequestOptions::builder());

        assert!(request.run(1).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let succeeded = Arc::new(AtomicU32::new(0));
        let (progress_sink, success_sink) = (Arc::clone(&progress), Arc::clone(&succeeded));
        let request = request(
            flaky(2, &calls),
            RequestOptions::builder()
                .with(RetryOptions::new().count(RetryCount::Limited(3)))
                .hooks(move |hooks| {
                    let sink = Arc::clone(&progress_sink);
                    let _ = hooks.retry_progress.on_sync(move |(attempt, _)| lock(&sink).push(*attempt));
                    let sink = Arc::clone(&success_sink);
                    let _ = hooks.retry_success.on_sync(move |(data, _)| sink.store(*data, Ordering::SeqCst));
                }),
        );

        let start = Instant::now();
        assert_eq!(request.run(7).await.expect("run"), Some(7));
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*lock(&progress), vec![1, 2]);
        assert_eq!(succeeded.load(Ordering::SeqCst), 7);
        assert_eq!(request.state().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));
        let sink = Arc::clone(&failures);
        let request = request(
            flaky(u32::MAX, &calls),
            RequestOptions::builder()
                .with(RetryOptions::new().count(RetryCount::Limited(2)).interval(|_| Duration::from_millis(10)))
                .hooks(move |hooks| {
                    let sink = Arc::clone(&sink);
                    let _ = hooks.retry_fail.on_sync(move |_| {
                        sink.fetch_add(1, Ordering::SeqCst);
                    });
                }),
        );

        assert_eq!(request.run(1).await, Err(Error::http(503, "unavailable")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disallowed_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let request = request(
            flaky(u32::MAX, &calls),
            RequestOptions::builder().with(
                RetryOptions::new()
                    .count(RetryCount::Unlimited)
                    .allow(|err, _| err.is_client_error()),
            ),
        );

        assert!(request.run(1).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parser_rejections_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let request = request(
            Fetcher::new(move |_: u32| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(call) }
            }),
            RequestOptions::builder()
                .data_parser(sluice_core::DataParser::from_fn(|raw: u32| {
                    if raw < 2 { Err(Error::invalid_data("too small")) } else { Ok(raw) }
                }))
                .with(RetryOptions::new().count(RetryCount::Limited(5)).interval(|_| Duration::from_millis(1))),
        );

        assert_eq!(request.run(0).await.expect("run"), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_unlimited_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let request = request(
            flaky(u32::MAX, &calls),
            RequestOptions::builder().with(RetryOptions::new().count(RetryCount::Unlimited)),
        );

        let (result, ()) = tokio::join!(request.run(1), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            request.cancel();
        });
        assert_eq!(result.expect("cancelled run resolves"), None);

        let made = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), made);
    }
}
