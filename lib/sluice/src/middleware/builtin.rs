//! Middleware every slot gets by default.
//!
//! | Name | Priority | Behaviour |
//! |------|----------|-----------|
//! | `builtin:ready` | 100000 | vetoes runs whose parameters are not ready |
//! | `builtin:error` | 1000 | records the error, optionally resets data |
//! | `builtin:loading` | 1000 | delayed, edge-triggered `loading` flag |
//! | `builtin:single` | 1000 | skips or forces runs while others are pending |
//! | `builtin:immediate` | lowest | runs once with the default parameters |
//!
//! Exclude any of them with `ignore_middleware`.

use std::sync::{Arc, Mutex};

use sluice_core::{Data, Params, StatePatch, lock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Middleware;
use crate::context::BasicContext;

/// The built-in middleware, in registration order.
#[must_use]
pub fn middleware<T: Data, P: Params>() -> Vec<Arc<dyn Middleware<T, P>>> {
    vec![
        Arc::new(Ready),
        Arc::new(ErrorState),
        Arc::new(Loading),
        Arc::new(Single),
        Arc::new(Immediate),
    ]
}

/// Silently cancels runs when the `ready` option rejects their parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ready;

impl<T: Data, P: Params> Middleware<T, P> for Ready {
    fn name(&self) -> Option<&str> {
        Some("builtin:ready")
    }

    fn priority(&self) -> i32 {
        100_000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let _ = ctx.hooks().preface.on_sync(|(params, ctx)| {
            if !ctx.options().is_ready(params) {
                debug!(key = %ctx.key(), "not ready");
                ctx.cancel(true);
            }
        });
    }
}

/// Stores the error of a failed run in the state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorState;

impl<T: Data, P: Params> Middleware<T, P> for ErrorState {
    fn name(&self) -> Option<&str> {
        Some("builtin:error")
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let _ = ctx.hooks().error.on_sync(|(error, ctx)| {
            let options = ctx.options();
            if options.init_data_when_error {
                ctx.mutate_data(options.init_data());
            }
            ctx.mutate_state(StatePatch::new().error(Some(error.clone())));
        });
    }
}

#[derive(Clone, Default)]
struct LoadingTimer(Arc<Mutex<Option<JoinHandle<()>>>>);

impl LoadingTimer {
    fn is_active(&self) -> bool {
        lock(&self.0)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn start(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.0).replace(handle) {
            previous.abort();
        }
    }

    fn stop(&self) {
        if let Some(handle) = lock(&self.0).take() {
            handle.abort();
        }
    }
}

fn toggle_loading<T: Data, P: Params>(ctx: &BasicContext<T, P>, loading: bool) {
    let changed = ctx.update_state(|state| {
        (state.loading != loading).then(|| StatePatch::new().loading(loading))
    });
    if changed {
        ctx.hooks().loading_change.call_sync((loading, ctx.clone()));
    }
}

/// Shows `loading` after `loading_delay`, hides it when the latest run ends
/// or nothing is pending any more.
///
/// Overlapping runs share one visible flag, so `loading_change` only fires
/// when the flag actually flips. Runs shorter than the delay never show it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Loading;

impl<T: Data, P: Params> Middleware<T, P> for Loading {
    fn name(&self) -> Option<&str> {
        Some("builtin:loading")
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let timer = LoadingTimer::default();
        ctx.store().set(timer.clone());

        let before_timer = timer.clone();
        let _ = ctx.hooks().before.on_sync(move |(_, ctx)| {
            if before_timer.is_active() || ctx.state().loading {
                return;
            }
            let delay = ctx.options().loading_delay;
            if delay.is_zero() {
                toggle_loading(ctx, true);
                return;
            }
            let slot = ctx.downgrade();
            before_timer.start(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(ctx) = slot.upgrade() {
                    toggle_loading(&ctx, true);
                }
            }));
        });

        let _ = ctx.hooks().finally.on_sync(move |ctx| {
            if ctx.is_latest_execution() || !ctx.has_pending() {
                timer.stop();
                toggle_loading(ctx, false);
            }
        });
    }
}

/// Applies the `single` and `single_with_force` options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Single;

impl<T: Data, P: Params> Middleware<T, P> for Single {
    fn name(&self) -> Option<&str> {
        Some("builtin:single")
    }

    fn priority(&self) -> i32 {
        1000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let _ = ctx.hooks().preface.on_sync(|(params, ctx)| {
            let options = ctx.options();
            if !options.is_single(params, &ctx.state().params) {
                return;
            }
            if options.single_with_force {
                ctx.clear_pending_with_cancel();
            }
            if ctx.has_pending() {
                debug!(key = %ctx.key(), "run skipped, another one is pending");
                ctx.cancel(true);
            }
        });
    }
}

/// Runs the slot once with its default parameters when it is created.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl<T: Data, P: Params> Middleware<T, P> for Immediate {
    fn name(&self) -> Option<&str> {
        Some("builtin:immediate")
    }

    fn priority(&self) -> i32 {
        i32::MIN
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let options = ctx.options();
        if !options.immediate {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %ctx.key(), "no runtime available, immediate run skipped");
            return;
        };
        let slot = ctx.downgrade();
        let params = options.default_params.clone();
        handle.spawn(async move {
            let Some(ctx) = slot.upgrade() else {
                return;
            };
            if let Err(err) = ctx.run(params).await {
                warn!(key = %ctx.key(), error = %err, "immediate run failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use sluice_core::{Error, Fetcher};

    use super::*;
    use crate::engine::{Engine, Request};
    use crate::options::RequestOptions;

    fn sleepy(ms: u64) -> Fetcher<u32, u32> {
        Fetcher::new(move |n: u32| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(n)
        })
    }

    fn loading_log(request: &Request<u32, u32>) -> Arc<Mutex<Vec<bool>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let _ = request
            .hooks()
            .loading_change
            .on_sync(move |(loading, _)| lock(&sink).push(*loading));
        log
    }

    #[tokio::test]
    async fn not_ready_runs_are_vetoed() {
        let engine: Engine<u32, u32> = Engine::default();
        let request = engine.request(
            sleepy(0),
            RequestOptions::builder().ready(|params| *params > 0),
        );

        assert_eq!(request.run(0).await.expect("run"), None);
        assert_eq!(request.state().params, 0);
        assert_eq!(request.run(3).await.expect("run"), Some(3));
    }

    #[tokio::test]
    async fn error_keeps_or_resets_data() {
        let engine: Engine<u32, u32> = Engine::default();
        let fetcher = Fetcher::new(|n: u32| async move {
            if n == 0 {
                Err(Error::fetch("zero"))
            } else {
                Ok(n)
            }
        });

        let reset = engine.request(fetcher.clone(), RequestOptions::builder());
        reset.run(5).await.expect("run");
        assert!(reset.run(0).await.is_err());
        assert_eq!(reset.state().data, None);

        let keep = engine.request(fetcher, RequestOptions::builder().init_data_when_error(false));
        keep.run(5).await.expect("run");
        assert!(keep.run(0).await.is_err());
        assert_eq!(keep.state().data, Some(5));
        assert_eq!(keep.state().error, Some(Error::fetch("zero")));

        keep.run(6).await.expect("run");
        assert_eq!(keep.state().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_runs_never_show_loading() {
        let engine: Engine<u32, u32> = Engine::default();
        let request = engine.request(sleepy(100), RequestOptions::builder());
        let log = loading_log(&request);

        request.run(1).await.expect("run");
        assert!(lock(&log).is_empty());
        assert!(!request.state().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_runs_toggle_loading_once() {
        let engine: Engine<u32, u32> = Engine::default();
        let request = engine.request(sleepy(1000), RequestOptions::builder());
        let log = loading_log(&request);

        let (first, second) = tokio::join!(request.run(1), request.run(2));
        first.expect("run");
        second.expect("run");

        assert_eq!(*lock(&log), vec![true, false]);
        assert!(!request.state().loading);
    }

    #[tokio::test(start_paused = true)]
    async fn single_skips_overlapping_runs() {
        let engine: Engine<u32, u32> = Engine::default();
        let fetched = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fetched);
        let request = engine.request(
            Fetcher::new(move |n: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(n)
                }
            }),
            RequestOptions::builder().single(|_, _| true),
        );

        let (first, second) = tokio::join!(request.run(1), request.run(2));
        assert_eq!(first.expect("run"), Some(1));
        assert_eq!(second.expect("run"), None);
        assert_eq!(fetched.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_with_force_cancels_pending_runs() {
        let engine: Engine<u32, u32> = Engine::default();
        let discarded = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&discarded);
        let request = engine.request(
            sleepy(50),
            RequestOptions::builder()
                .single(|_, _| true)
                .single_with_force(true)
                .hooks(move |hooks| {
                    let counter = Arc::clone(&counter);
                    let _ = hooks.discarded.on_sync(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }),
        );

        let (first, second) = tokio::join!(request.run(1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            request.run(2).await
        });
        first.expect("run");
        assert_eq!(second.expect("run"), Some(2));
        assert_eq!(discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn immediate_runs_with_default_params() {
        let engine: Engine<u32, u32> = Engine::default();
        let request = engine.request(
            sleepy(0),
            RequestOptions::builder().immediate(true).default_params(9),
        );

        for _ in 0..10 {
            if request.state().data.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(request.state().data, Some(9));
    }
}
