//! Tracking of in-flight executions.

use std::sync::{Arc, Mutex};

use sluice_core::{Data, Params, lock};

use crate::context::Context;
use crate::hooks::RequestHooks;
use crate::options::HookInstaller;

/// Executions of a slot currently between `before` and `finally`.
pub struct PendingManager<T, P> {
    contexts: Mutex<Vec<Context<T, P>>>,
}

impl<T, P> std::fmt::Debug for PendingManager<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingManager")
            .field("pending", &lock(&self.contexts).len())
            .finish()
    }
}

impl<T, P> Default for PendingManager<T, P> {
    fn default() -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Data, P: Params> PendingManager<T, P> {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if any execution is pending.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !lock(&self.contexts).is_empty()
    }

    /// Number of pending executions.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.contexts).len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Forget every pending execution.
    pub fn clear(&self) {
        lock(&self.contexts).clear();
    }

    /// Cancel every pending execution, then forget them.
    ///
    /// The set is emptied right away, without waiting for the cancelled
    /// executions to reach `finally`.
    pub fn clear_with_cancel(&self) {
        let contexts = std::mem::take(&mut *lock(&self.contexts));
        for ctx in contexts {
            ctx.cancel(false);
        }
    }

    /// Start tracking an execution, once.
    pub fn track(&self, ctx: &Context<T, P>) {
        let mut contexts = lock(&self.contexts);
        if !contexts.iter().any(|pending| pending.is_same(ctx)) {
            contexts.push(ctx.clone());
        }
    }

    /// Stop tracking an execution.
    pub fn untrack(&self, ctx: &Context<T, P>) {
        lock(&self.contexts).retain(|pending| !pending.is_same(ctx));
    }

    /// Hook installer wiring a slot's pending manager to its lifecycle.
    #[must_use]
    pub fn installer() -> HookInstaller<T, P> {
        Arc::new(|hooks: &RequestHooks<T, P>| {
            let _ = hooks.before.on_sync(|(_, ctx)| ctx.inner.pending.track(ctx));
            let _ = hooks.finally.on_sync(|ctx| ctx.inner.pending.untrack(ctx));
            let _ = hooks.dispose.on_sync(|ctx| ctx.inner.pending.clear());
        })
    }
}
