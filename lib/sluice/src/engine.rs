//! Engine, request slots and the execution algorithm.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use sluice_core::{
    Data, Error, Executor, Fetcher, Params, RequestState, Result, StatePatch, Store, Switch, lock,
};
use tracing::{debug, warn};

use crate::context::{BasicContext, Context, SlotInner};
use crate::hooks::RequestHooks;
use crate::middleware::{Middleware, Pipeline, Terminal, builtin, normalize};
use crate::options::{RequestOptions, RequestOptionsBuilder};
use crate::pending::PendingManager;
use crate::runtime::Runtime;

/// Creates request slots that share global options and a runtime.
///
/// # Example
///
/// ```ignore
/// use sluice::prelude::*;
///
/// let engine = Engine::new(RequestOptions::builder().loading_delay(Duration::ZERO));
/// let request = engine.request(
///     Fetcher::new(|id: u64| async move { Ok(id * 2) }),
///     RequestOptions::builder().key("double"),
/// );
/// assert_eq!(request.run(21).await?, Some(42));
/// ```
pub struct Engine<T, P> {
    options: RequestOptionsBuilder<T, P>,
    runtime: Runtime,
}

impl<T, P: Clone> Clone for Engine<T, P> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<T, P: std::fmt::Debug> std::fmt::Debug for Engine<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("options", &self.options)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl<T: Data, P: Params> Default for Engine<T, P> {
    fn default() -> Self {
        Self::new(RequestOptionsBuilder::default())
    }
}

impl<T: Data, P: Params> Engine<T, P> {
    /// Create an engine with its own runtime.
    #[must_use]
    pub fn new(options: RequestOptionsBuilder<T, P>) -> Self {
        Self::with_runtime(options, Runtime::new())
    }

    /// Create an engine on a shared runtime.
    #[must_use]
    pub fn with_runtime(options: RequestOptionsBuilder<T, P>, runtime: Runtime) -> Self {
        Self { options, runtime }
    }

    /// The runtime this engine's slots share.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Global options.
    #[must_use]
    pub fn options(&self) -> &RequestOptionsBuilder<T, P> {
        &self.options
    }

    /// Create a request slot.
    ///
    /// Per-request `options` are merged over the engine's global ones. Every
    /// middleware is set up before this returns.
    pub fn request(&self, fetcher: Fetcher<T, P>, options: RequestOptionsBuilder<T, P>) -> Request<T, P> {
        let options = self.options.clone().merge(options).build();
        let key = options
            .key
            .clone()
            .or_else(|| options.key_generator.as_ref().and_then(|generate| generate()))
            .unwrap_or_else(|| self.runtime.keys().next_key());

        let candidates = builtin::middleware::<T, P>()
            .into_iter()
            .chain(options.middleware.iter().cloned());
        let middleware: Vec<Arc<dyn Middleware<T, P>>> = normalize(candidates)
            .into_iter()
            .filter(|middleware| middleware.name().is_none_or(|name| !options.is_ignored(name)))
            .collect();
        let pipeline = Pipeline::new(middleware);

        let hooks = RequestHooks::new();
        PendingManager::<T, P>::installer()(&hooks);
        for install in &options.hooks {
            install(&hooks);
        }

        let init_data = options.init_data();
        let id = self.runtime.next_slot_id();
        debug!(%key, slot = id, middleware = ?pipeline, "request created");

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<SlotInner<T, P>>| {
            let weak = weak.clone();
            let executor = Executor::new(move |params: P| {
                let slot = weak.upgrade().map(|inner| BasicContext { inner });
                async move {
                    match slot {
                        Some(slot) => slot.execute(params).await,
                        None => Err(Error::Disposed),
                    }
                }
            });
            SlotInner {
                id,
                key,
                options: Mutex::new(Arc::new(options)),
                state: Mutex::new(RequestState::new(init_data.clone())),
                last_broadcast: Mutex::new(init_data),
                raw_data: Mutex::new(None),
                hooks,
                fetcher,
                executor: Mutex::new(executor),
                store: Store::new(),
                result: Store::new(),
                pending: PendingManager::new(),
                latest: Mutex::new(None),
                disposed: Switch::once(),
                runtime: self.runtime.clone(),
                pipeline,
                next_execution: AtomicU64::new(0),
            }
        });
        let ctx = BasicContext { inner };

        for middleware in ctx.inner.pipeline.iter() {
            middleware.setup(&ctx);
        }

        Request { ctx }
    }
}

impl<T: Data, P: Params> BasicContext<T, P> {
    /// One execution, end to end.
    pub(crate) async fn execute(self, params: P) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let ctx = Context::start(self.clone(), params);
        debug!(key = %self.key(), execution = ctx.id(), "execution started");
        let guard = Abandoned { ctx: Some(ctx.clone()) };

        let outcome = match self.drive(&ctx).await {
            Err(err) if ctx.is_cancelled() => {
                debug!(key = %self.key(), execution = ctx.id(), error = %err, "error after cancellation ignored");
                Ok(())
            }
            Err(err) => {
                self.route_error(&ctx, err.clone()).await;
                Err(err)
            }
            Ok(()) => Ok(()),
        };

        if ctx.is_cancelled() {
            self.teardown(&ctx).await;
            guard.disarm();
            return outcome;
        }

        let after = self
            .inner
            .hooks
            .after
            .call_serial((self.state(), ctx.clone()))
            .await;
        let outcome = match after {
            Ok(()) => outcome,
            Err(err) => {
                self.route_error(&ctx, err.clone()).await;
                outcome.and(Err(err))
            }
        };

        self.teardown(&ctx).await;
        guard.disarm();
        outcome
    }

    async fn drive(&self, ctx: &Context<T, P>) -> Result<()> {
        let hooks = &self.inner.hooks;
        let params = ctx.params();

        hooks.preface.call_serial((params.clone(), ctx.clone())).await?;
        if ctx.is_cancelled() {
            return Ok(());
        }

        let options = self.options();
        let mut patch = StatePatch::new().params(params.clone()).error(None);
        if !options.keep_previous_data {
            patch = patch.data(options.init_data());
        }
        self.mutate_state(patch);

        hooks.before.call_serial((params, ctx.clone())).await?;
        if ctx.is_cancelled() {
            return Ok(());
        }

        self.inner
            .pipeline
            .dispatch(ctx.clone(), terminal::<T, P>())
            .await?;
        if ctx.is_cancelled() {
            return Ok(());
        }

        hooks.success.call_serial((self.state().data, ctx.clone())).await
    }

    async fn route_error(&self, ctx: &Context<T, P>, error: Error) {
        ctx.fail();
        debug!(key = %self.key(), execution = ctx.id(), %error, "execution failed");
        if let Err(err) = self.inner.hooks.error.call_serial((error, ctx.clone())).await {
            warn!(key = %self.key(), error = %err, "error hook failed");
        }
    }

    async fn teardown(&self, ctx: &Context<T, P>) {
        self.flush_data();
        if let Err(err) = self.inner.hooks.finally.call_serial(ctx.clone()).await {
            warn!(key = %self.key(), error = %err, "finally hook failed");
        }
        ctx.clear_latest();
        debug!(key = %self.key(), execution = ctx.id(), "execution finished");
    }

    /// Teardown of an execution whose future was dropped before it finished.
    ///
    /// Sync `finally` callbacks run inline, async ones are spawned.
    fn abandon(&self, ctx: &Context<T, P>) {
        debug!(key = %self.key(), execution = ctx.id(), "execution dropped");
        ctx.cancel(true);
        self.inner.pending.untrack(ctx);
        self.flush_data();
        self.inner.hooks.finally.call_sync(ctx.clone());
        ctx.clear_latest();
    }

    /// Broadcast staged data if it differs from what listeners last saw.
    fn flush_data(&self) {
        let options = self.options();
        let inner = &self.inner;
        self.update_state(|state| {
            let last = lock(&inner.last_broadcast);
            if options.same_data(state.data.as_ref(), last.as_ref()) {
                None
            } else {
                Some(StatePatch::new().data(state.data.clone()))
            }
        });
    }
}

/// Tears an execution down if its future is dropped before `teardown` ran.
struct Abandoned<T: Data, P: Params> {
    ctx: Option<Context<T, P>>,
}

impl<T: Data, P: Params> Abandoned<T, P> {
    fn disarm(mut self) {
        self.ctx = None;
    }
}

impl<T: Data, P: Params> Drop for Abandoned<T, P> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.basic().abandon(&ctx);
        }
    }
}

/// The fetch step at the end of every chain.
fn terminal<T: Data, P: Params>() -> Terminal<T, P> {
    Arc::new(|ctx: Context<T, P>| fetch_step(ctx).boxed())
}

async fn fetch_step<T: Data, P: Params>(ctx: Context<T, P>) -> Result<()> {
    let fetch = ctx.fetcher().call(ctx.params());
    let raw = tokio::select! {
        biased;
        () = ctx.cancelled() => None,
        result = fetch => Some(result?),
    };
    let Some(raw) = raw else {
        debug!(key = %ctx.key(), execution = ctx.id(), "fetch result discarded");
        return ctx.hooks().discarded.call_serial(ctx.clone()).await;
    };
    if ctx.is_cancelled() {
        return Ok(());
    }

    *lock(&ctx.inner.raw_data) = Some(raw.clone());

    let options = ctx.options();
    let mut data = options.data_parser.call(raw).await?;
    if let Some(calibrate) = &options.data_calibrator {
        data = calibrate(data);
    }
    ctx.mutate_data(Some(data));
    Ok(())
}

/// A request slot: one logical request, many executions.
///
/// Cloning yields another handle to the same slot.
pub struct Request<T, P> {
    ctx: BasicContext<T, P>,
}

impl<T, P> Clone for Request<T, P> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<T, P> std::fmt::Debug for Request<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("key", &self.ctx.inner.key)
            .finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> Request<T, P> {
    /// The slot key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.ctx.key()
    }

    /// Snapshot of the visible state.
    #[must_use]
    pub fn state(&self) -> RequestState<T, P> {
        self.ctx.state()
    }

    /// The slot context.
    #[must_use]
    pub fn context(&self) -> &BasicContext<T, P> {
        &self.ctx
    }

    /// The slot hooks.
    #[must_use]
    pub fn hooks(&self) -> &RequestHooks<T, P> {
        self.ctx.hooks()
    }

    /// A value a middleware exposed on the result.
    #[must_use]
    pub fn result_ext<V>(&self) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.ctx.result::<V>()
    }

    /// Run with `params` and return the resulting data.
    ///
    /// Cancelled executions resolve with the current data. Failures are routed
    /// through the `error` hook before they are returned.
    pub async fn run(&self, params: P) -> Result<Option<T>> {
        self.ctx.run(params).await
    }

    /// Run again with the last parameters.
    pub async fn refresh(&self) -> Result<Option<T>> {
        self.ctx.refresh().await
    }

    /// Cancel the latest execution and fire the `cancel` hook.
    pub fn cancel(&self) {
        self.ctx.cancel_latest(false);
    }

    /// Cancel the latest execution without firing the `cancel` hook.
    pub fn cancel_silently(&self) {
        self.ctx.cancel_latest(true);
    }

    /// Returns `true` if an execution is in flight.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.ctx.has_pending()
    }

    /// Cancel every execution in flight.
    pub fn cancel_all(&self) {
        self.ctx.clear_pending_with_cancel();
    }

    /// Returns `true` once the slot has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.ctx.is_disposed()
    }

    /// Release the slot.
    ///
    /// Fires `dispose` once, then removes every hook callback and clears the
    /// slot store. Later calls do nothing.
    pub async fn dispose(&self) {
        if !self.ctx.inner.disposed.open() {
            return;
        }
        if self.ctx.options().cancel_when_dispose {
            self.ctx.cancel_latest(false);
        }
        debug!(key = %self.key(), "disposing request");
        if let Err(err) = self.ctx.hooks().dispose.call_serial(self.ctx.clone()).await {
            warn!(key = %self.key(), error = %err, "dispose hook failed");
        }
        self.ctx.hooks().clear();
        self.ctx.store().clear();
    }
}
