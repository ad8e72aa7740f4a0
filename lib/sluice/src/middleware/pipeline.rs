//! Continuation chain over normalized middleware.

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sluice_core::{Data, Params, Result};

use super::Middleware;
use crate::context::Context;

/// The step run after the last middleware calls `next`.
pub type Terminal<T, P> = Arc<dyn Fn(Context<T, P>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type Chain<T, P> = Arc<[Arc<dyn Middleware<T, P>>]>;

/// Continuation handed to [`Middleware::handle`].
///
/// `Next` is consumed by [`run`](Self::run), so a handler can continue the
/// chain at most once. Returning without running it short-circuits every
/// later middleware and the fetch.
#[must_use = "the chain stops here unless `run` is called"]
pub struct Next<T, P> {
    chain: Chain<T, P>,
    index: usize,
    ctx: Context<T, P>,
    terminal: Terminal<T, P>,
}

impl<T, P> std::fmt::Debug for Next<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("remaining", &self.chain.len().saturating_sub(self.index))
            .finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> Next<T, P> {
    /// Continue with the next middleware, or the terminal step after the last.
    pub fn run(self) -> BoxFuture<'static, Result<()>> {
        dispatch(self.chain, self.index, self.ctx, self.terminal)
    }
}

/// Middleware of a slot, sorted and filtered once at creation.
pub struct Pipeline<T, P> {
    chain: Chain<T, P>,
}

impl<T, P> Clone for Pipeline<T, P> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
        }
    }
}

impl<T: Data, P: Params> std::fmt::Debug for Pipeline<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .chain
            .iter()
            .map(|middleware| middleware.name().unwrap_or("<anonymous>"))
            .collect();
        f.debug_struct("Pipeline").field("middleware", &names).finish()
    }
}

impl<T: Data, P: Params> Pipeline<T, P> {
    /// Create a pipeline from already normalized middleware.
    #[must_use]
    pub fn new(middleware: Vec<Arc<dyn Middleware<T, P>>>) -> Self {
        Self {
            chain: middleware.into(),
        }
    }

    /// Middleware in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Middleware<T, P>>> {
        self.chain.iter()
    }

    /// Number of middleware.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Returns `true` if the pipeline has no middleware.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run every handler in order, then `terminal`.
    pub fn dispatch(&self, ctx: Context<T, P>, terminal: Terminal<T, P>) -> BoxFuture<'static, Result<()>> {
        dispatch(Arc::clone(&self.chain), 0, ctx, terminal)
    }
}

fn dispatch<T: Data, P: Params>(
    chain: Chain<T, P>,
    index: usize,
    ctx: Context<T, P>,
    terminal: Terminal<T, P>,
) -> BoxFuture<'static, Result<()>> {
    if ctx.is_cancelled() {
        return futures_util::future::ready(Ok(())).boxed();
    }
    match chain.get(index).cloned() {
        Some(middleware) => {
            let next = Next {
                chain,
                index: index + 1,
                ctx: ctx.clone(),
                terminal,
            };
            middleware.handle(ctx, next)
        }
        None => terminal(ctx),
    }
}
