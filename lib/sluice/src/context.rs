//! Slot and execution contexts.
//!
//! [`BasicContext`] is the slot a middleware sees at setup. [`Context`] adds the
//! per-execution surface: its own fetcher, cancellation and a private store.
//! Both are cheap handles; the weak variants let timers and fetcher wrappers
//! refer back to a slot without keeping it alive.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use sluice_core::{
    Data, Error, Executor, Fetcher, Params, RequestState, Result, StatePatch, Store, Switch, lock,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hooks::RequestHooks;
use crate::middleware::Pipeline;
use crate::options::RequestOptions;
use crate::pending::PendingManager;
use crate::runtime::Runtime;

pub(crate) struct SlotInner<T, P> {
    pub(crate) id: u64,
    pub(crate) key: String,
    pub(crate) options: Mutex<Arc<RequestOptions<T, P>>>,
    pub(crate) state: Mutex<RequestState<T, P>>,
    pub(crate) last_broadcast: Mutex<Option<T>>,
    pub(crate) raw_data: Mutex<Option<T>>,
    pub(crate) hooks: RequestHooks<T, P>,
    pub(crate) fetcher: Fetcher<T, P>,
    pub(crate) executor: Mutex<Executor<P>>,
    pub(crate) store: Store,
    pub(crate) result: Store,
    pub(crate) pending: PendingManager<T, P>,
    pub(crate) latest: Mutex<Option<Weak<Execution<T, P>>>>,
    pub(crate) disposed: Switch,
    pub(crate) runtime: Runtime,
    pub(crate) pipeline: Pipeline<T, P>,
    pub(crate) next_execution: AtomicU64,
}

pub(crate) struct Execution<T, P> {
    pub(crate) id: u64,
    pub(crate) params: P,
    pub(crate) fetcher: Mutex<Fetcher<T, P>>,
    pub(crate) cancelled: Switch,
    pub(crate) failed: Switch,
    pub(crate) token: CancellationToken,
    pub(crate) local: Store,
}

/// Handle to a request slot.
pub struct BasicContext<T, P> {
    pub(crate) inner: Arc<SlotInner<T, P>>,
}

impl<T, P> Clone for BasicContext<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, P> std::fmt::Debug for BasicContext<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicContext")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> BasicContext<T, P> {
    /// Unique id of the slot within its runtime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The slot key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current options.
    #[must_use]
    pub fn options(&self) -> Arc<RequestOptions<T, P>> {
        Arc::clone(&lock(&self.inner.options))
    }

    /// Change the options of later executions.
    pub fn mutate_options(&self, mutate: impl FnOnce(&mut RequestOptions<T, P>)) {
        let mut options = lock(&self.inner.options);
        mutate(Arc::make_mut(&mut options));
    }

    /// Snapshot of the visible state.
    #[must_use]
    pub fn state(&self) -> RequestState<T, P> {
        lock(&self.inner.state).clone()
    }

    /// Shallow-merge `patch` into the state and fire `state_change`.
    pub fn mutate_state(&self, patch: StatePatch<T, P>) {
        self.update_state(|_| Some(patch));
    }

    /// Compute a patch from the current state and apply it atomically.
    ///
    /// Returns `true` if a patch was applied. `state_change` fires after the
    /// state lock is released.
    pub fn update_state(
        &self,
        compute: impl FnOnce(&RequestState<T, P>) -> Option<StatePatch<T, P>>,
    ) -> bool {
        let patch = {
            let mut state = lock(&self.inner.state);
            let Some(patch) = compute(&state) else {
                return false;
            };
            patch.apply(&mut state);
            if let Some(data) = &patch.data {
                *lock(&self.inner.last_broadcast) = data.clone();
            }
            patch
        };
        self.inner.hooks.state_change.call_sync((patch, self.clone()));
        true
    }

    /// Read a result extension set with [`mutate_result`](Self::mutate_result).
    #[must_use]
    pub fn result<V>(&self) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.inner.result.try_get::<V>()
    }

    /// Expose a value on the request result.
    pub fn mutate_result<V>(&self, value: V)
    where
        V: Clone + Send + Sync + 'static,
    {
        self.inner.result.set(value);
    }

    /// The slot hooks.
    #[must_use]
    pub fn hooks(&self) -> &RequestHooks<T, P> {
        &self.inner.hooks
    }

    /// The fetcher the slot was created with.
    #[must_use]
    pub fn fetcher(&self) -> Fetcher<T, P> {
        self.inner.fetcher.clone()
    }

    /// The executor `run` goes through.
    #[must_use]
    pub fn executor(&self) -> Executor<P> {
        lock(&self.inner.executor).clone()
    }

    /// Replace the executor `run` goes through.
    pub fn set_executor(&self, executor: Executor<P>) {
        *lock(&self.inner.executor) = executor;
    }

    /// Slot-level store shared by every execution.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// The last raw value returned by the fetcher.
    #[must_use]
    pub fn raw_data(&self) -> Option<T> {
        lock(&self.inner.raw_data).clone()
    }

    /// Returns `true` if an execution is between `before` and `finally`.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inner.pending.has_pending()
    }

    /// Forget every pending execution.
    pub fn clear_pending(&self) {
        self.inner.pending.clear();
    }

    /// Cancel every pending execution, then forget them.
    pub fn clear_pending_with_cancel(&self) {
        self.inner.pending.clear_with_cancel();
    }

    /// The runtime shared with other slots.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Returns `true` once the slot has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_on()
    }

    /// Run the slot with `params` and return the resulting data.
    pub fn run(&self, params: P) -> impl Future<Output = Result<Option<T>>> + Send + 'static {
        let ctx = self.clone();
        async move {
            if ctx.is_disposed() {
                return Err(Error::Disposed);
            }
            ctx.executor().call(params).await?;
            Ok(ctx.state().data)
        }
    }

    /// Run the slot again with the last parameters.
    pub fn refresh(&self) -> impl Future<Output = Result<Option<T>>> + Send + 'static {
        let params = self.state().params;
        self.run(params)
    }

    /// Cancel the latest execution.
    pub fn cancel_latest(&self, silent: bool) {
        let latest = lock(&self.inner.latest).as_ref().and_then(Weak::upgrade);
        if let Some(exec) = latest {
            Context {
                basic: self.clone(),
                exec,
            }
            .cancel(silent);
        }
    }

    /// A weak handle to the slot.
    #[must_use]
    pub fn downgrade(&self) -> WeakBasicContext<T, P> {
        WeakBasicContext {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Weak handle to a request slot.
pub struct WeakBasicContext<T, P> {
    inner: Weak<SlotInner<T, P>>,
}

impl<T, P> Clone for WeakBasicContext<T, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T, P> std::fmt::Debug for WeakBasicContext<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakBasicContext").finish_non_exhaustive()
    }
}

impl<T, P> WeakBasicContext<T, P> {
    /// Get the slot back if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<BasicContext<T, P>> {
        self.inner.upgrade().map(|inner| BasicContext { inner })
    }
}

/// Context of a single execution.
///
/// Dereferences to the [`BasicContext`] of its slot.
pub struct Context<T, P> {
    basic: BasicContext<T, P>,
    exec: Arc<Execution<T, P>>,
}

impl<T, P> Clone for Context<T, P> {
    fn clone(&self) -> Self {
        Self {
            basic: self.basic.clone(),
            exec: Arc::clone(&self.exec),
        }
    }
}

impl<T, P> std::fmt::Debug for Context<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("key", &self.basic.inner.key)
            .field("execution", &self.exec.id)
            .field("cancelled", &self.exec.cancelled.is_on())
            .finish_non_exhaustive()
    }
}

impl<T, P> Deref for Context<T, P> {
    type Target = BasicContext<T, P>;

    fn deref(&self) -> &Self::Target {
        &self.basic
    }
}

impl<T: Data, P: Params> Context<T, P> {
    /// Allocate an execution and record it as the latest one.
    pub(crate) fn start(basic: BasicContext<T, P>, params: P) -> Self {
        let id = basic.inner.next_execution.fetch_add(1, Ordering::SeqCst);
        let exec = Arc::new(Execution {
            id,
            params,
            fetcher: Mutex::new(basic.fetcher()),
            cancelled: Switch::once(),
            failed: Switch::once(),
            token: CancellationToken::new(),
            local: Store::new(),
        });
        *lock(&basic.inner.latest) = Some(Arc::downgrade(&exec));
        Self { basic, exec }
    }

    /// The slot this execution belongs to.
    #[must_use]
    pub fn basic(&self) -> &BasicContext<T, P> {
        &self.basic
    }

    /// Execution id, unique within the slot.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.exec.id
    }

    /// The parameters this execution was started with.
    #[must_use]
    pub fn params(&self) -> P {
        self.exec.params.clone()
    }

    /// Stage new data without firing `state_change`.
    ///
    /// The change is broadcast once, when the execution finishes, if the
    /// comparer considers it different from the last broadcast data.
    pub fn mutate_data(&self, data: Option<T>) {
        lock(&self.basic.inner.state).data = data;
    }

    /// The fetcher of this execution.
    #[must_use]
    pub fn fetcher(&self) -> Fetcher<T, P> {
        lock(&self.exec.fetcher).clone()
    }

    /// Replace the fetcher of this execution.
    pub fn set_fetcher(&self, fetcher: Fetcher<T, P>) {
        *lock(&self.exec.fetcher) = fetcher;
    }

    /// Store private to this execution.
    #[must_use]
    pub fn local(&self) -> &Store {
        &self.exec.local
    }

    /// Returns `true` if the slot's latest-execution pointer still refers to
    /// this execution.
    #[must_use]
    pub fn is_latest_execution(&self) -> bool {
        lock(&self.basic.inner.latest)
            .as_ref()
            .is_some_and(|latest| std::ptr::eq(latest.as_ptr(), Arc::as_ptr(&self.exec)))
    }

    /// Returns `true` once an error was routed for this execution.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exec.failed.is_on()
    }

    /// Returns `true` once this execution was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.exec.cancelled.is_on()
    }

    /// Cancel this execution.
    ///
    /// Idempotent. Unless `silent`, the `cancel` hook fires with the current
    /// state. An in-flight fetch is abandoned and reported as discarded.
    pub fn cancel(&self, silent: bool) {
        if !self.exec.cancelled.open() {
            return;
        }
        debug!(key = %self.key(), execution = self.exec.id, silent, "execution cancelled");
        if !silent {
            self.basic
                .inner
                .hooks
                .cancel
                .call_sync((self.state(), self.clone()));
        }
        self.exec.token.cancel();
    }

    /// Resolves when this execution is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        self.exec.token.clone().cancelled_owned()
    }

    /// A weak handle to this execution.
    #[must_use]
    pub fn downgrade(&self) -> WeakContext<T, P> {
        WeakContext {
            basic: self.basic.downgrade(),
            exec: Arc::downgrade(&self.exec),
        }
    }

    pub(crate) fn fail(&self) {
        self.exec.failed.open();
    }

    pub(crate) fn is_same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.exec, &other.exec)
    }

    pub(crate) fn clear_latest(&self) {
        let mut latest = lock(&self.basic.inner.latest);
        if latest
            .as_ref()
            .is_some_and(|current| std::ptr::eq(current.as_ptr(), Arc::as_ptr(&self.exec)))
        {
            *latest = None;
        }
    }
}

/// Weak handle to an execution.
pub struct WeakContext<T, P> {
    basic: WeakBasicContext<T, P>,
    exec: Weak<Execution<T, P>>,
}

impl<T, P> Clone for WeakContext<T, P> {
    fn clone(&self) -> Self {
        Self {
            basic: self.basic.clone(),
            exec: Weak::clone(&self.exec),
        }
    }
}

impl<T, P> std::fmt::Debug for WeakContext<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakContext").finish_non_exhaustive()
    }
}

impl<T, P> WeakContext<T, P> {
    /// Get the execution back if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Context<T, P>> {
        let basic = self.basic.upgrade()?;
        let exec = self.exec.upgrade()?;
        Some(Context { basic, exec })
    }
}
