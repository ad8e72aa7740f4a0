//! Named, ordered, async-aware pub/sub.
//!
//! A [`Hook`] is a single named event. Callbacks run in registration order and
//! can be invoked three ways:
//!
//! | Call | Behaviour |
//! |------|-----------|
//! | [`Hook::call_serial`] | awaits each callback in turn, stops at the first error |
//! | [`Hook::call_parallel`] | runs every callback concurrently, reports the first error |
//! | [`Hook::call_sync`] | runs sync callbacks inline, spawns async ones and returns |
//!
//! Serial ordering is a contract: later callbacks may rely on side effects of
//! earlier ones.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use tracing::{trace, warn};

use crate::{Result, lock};

/// Future returned by async hook callbacks.
pub type HookFuture = BoxFuture<'static, Result<()>>;

type SyncCallback<A> = Arc<dyn Fn(&A) + Send + Sync>;
type AsyncCallback<A> = Arc<dyn Fn(A) -> HookFuture + Send + Sync>;

enum Callback<A> {
    Sync(SyncCallback<A>),
    Async(AsyncCallback<A>),
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(f) => Self::Sync(Arc::clone(f)),
            Self::Async(f) => Self::Async(Arc::clone(f)),
        }
    }
}

struct Entry<A> {
    id: u64,
    once: bool,
    callback: Callback<A>,
}

struct HookInner<A> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<A>>>,
}

/// A single named event with ordered callbacks.
///
/// Cloning a hook yields another handle to the same callback list.
pub struct Hook<A> {
    inner: Arc<HookInner<A>>,
}

impl<A> Clone for Hook<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> std::fmt::Debug for Hook<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.inner.name)
            .field("callbacks", &lock(&self.inner.entries).len())
            .finish()
    }
}

/// Handle returned when registering a callback.
///
/// Dropping it keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
#[must_use = "dropping the handle keeps the callback registered"]
pub struct Unsubscribe {
    remove: Box<dyn FnOnce() + Send + Sync>,
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe").finish_non_exhaustive()
    }
}

impl Unsubscribe {
    /// Remove the callback from its hook.
    pub fn unsubscribe(self) {
        (self.remove)();
    }
}

impl<A> Hook<A>
where
    A: Clone + Send + 'static,
{
    /// Create an empty hook.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(HookInner {
                name,
                next_id: AtomicU64::new(0),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The hook name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// Returns `true` if no callback is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register an async callback.
    pub fn on<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(false, Callback::Async(Arc::new(move |args| callback(args).boxed())))
    }

    /// Register an async callback that runs at most once.
    pub fn once<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(true, Callback::Async(Arc::new(move |args| callback(args).boxed())))
    }

    /// Register a synchronous callback.
    pub fn on_sync(&self, callback: impl Fn(&A) + Send + Sync + 'static) -> Unsubscribe {
        self.register(false, Callback::Sync(Arc::new(callback)))
    }

    /// Register a synchronous callback that runs at most once.
    pub fn once_sync(&self, callback: impl Fn(&A) + Send + Sync + 'static) -> Unsubscribe {
        self.register(true, Callback::Sync(Arc::new(callback)))
    }

    /// Remove every callback.
    pub fn clear(&self) {
        lock(&self.inner.entries).clear();
    }

    /// Await every callback in registration order.
    ///
    /// Stops at the first callback that returns an error and returns it.
    pub async fn call_serial(&self, args: A) -> Result<()> {
        let entries = self.entries();
        trace!(hook = self.inner.name, callbacks = entries.len(), "calling hook");
        for (id, once, callback) in entries {
            // `once` entries leave the list only when they actually run.
            if once && !self.claim(id) {
                continue;
            }
            match callback {
                Callback::Sync(f) => f(&args),
                Callback::Async(f) => f(args.clone()).await?,
            }
        }
        Ok(())
    }

    /// Run every callback concurrently and wait for all of them.
    ///
    /// Returns the first error in registration order, if any.
    pub async fn call_parallel(&self, args: A) -> Result<()> {
        let callbacks = self.snapshot();
        trace!(hook = self.inner.name, callbacks = callbacks.len(), "calling hook in parallel");
        let futures = callbacks.into_iter().map(|callback| match callback {
            Callback::Sync(f) => {
                f(&args);
                futures_util::future::ready(Ok(())).boxed()
            }
            Callback::Async(f) => f(args.clone()),
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Fire-and-forget: sync callbacks run before this returns, async callbacks
    /// are spawned on the current Tokio runtime.
    pub fn call_sync(&self, args: A) {
        let callbacks = self.snapshot();
        for callback in callbacks {
            match callback {
                Callback::Sync(f) => f(&args),
                Callback::Async(f) => {
                    let name = self.inner.name;
                    let future = f(args.clone());
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            handle.spawn(async move {
                                if let Err(err) = future.await {
                                    warn!(hook = name, error = %err, "detached hook callback failed");
                                }
                            });
                        }
                        Err(_) => {
                            warn!(hook = name, "no runtime available, async callback skipped");
                        }
                    }
                }
            }
        }
    }

    fn register(&self, once: bool, callback: Callback<A>) -> Unsubscribe {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.entries).push(Entry { id, once, callback });

        let weak: Weak<HookInner<A>> = Arc::downgrade(&self.inner);
        Unsubscribe {
            remove: Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    lock(&inner.entries).retain(|entry| entry.id != id);
                }
            }),
        }
    }

    fn entries(&self) -> Vec<(u64, bool, Callback<A>)> {
        lock(&self.inner.entries)
            .iter()
            .map(|entry| (entry.id, entry.once, entry.callback.clone()))
            .collect()
    }

    /// Remove the `once` entry `id`. Returns `false` if another call took it.
    fn claim(&self, id: u64) -> bool {
        let mut entries = lock(&self.inner.entries);
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Callback<A>> {
        let mut entries = lock(&self.inner.entries);
        let callbacks = entries.iter().map(|entry| entry.callback.clone()).collect();
        entries.retain(|entry| !entry.once);
        callbacks
    }
}
