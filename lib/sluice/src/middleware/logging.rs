//! Execution logging middleware.
//!
//! Logs every execution of a slot using the `tracing` crate.

use std::time::Instant;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sluice_core::{Data, Params, Result};
use tracing::{Instrument, debug, info, info_span, warn};

use super::{Middleware, Next};
use crate::context::Context;

/// Log level for the logging middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Log at debug level (parameters and data).
    Debug,
    /// Log at info level (summary only).
    #[default]
    Info,
}

/// Middleware that logs executions.
///
/// # Example
///
/// ```ignore
/// use sluice::middleware::Logging;
///
/// let options = RequestOptions::builder().middleware(Logging::debug());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging {
    level: LogLevel,
}

impl Logging {
    /// Create a logging middleware with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logging middleware that logs at debug level.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            level: LogLevel::Debug,
        }
    }

    /// The configured level.
    #[must_use]
    pub fn level(&self) -> LogLevel {
        self.level
    }
}

impl<T: Data, P: Params> Middleware<T, P> for Logging {
    fn name(&self) -> Option<&str> {
        Some("builtin:logging")
    }

    fn priority(&self) -> i32 {
        10_000
    }

    fn handle(&self, ctx: Context<T, P>, next: Next<T, P>) -> BoxFuture<'static, Result<()>> {
        let level = self.level;
        let span = info_span!("request_execution", key = %ctx.key(), execution = ctx.id());

        async move {
            let start = Instant::now();

            match level {
                LogLevel::Debug => debug!(params = ?ctx.params(), "executing request"),
                LogLevel::Info => info!("executing request"),
            }

            let result = next.run().await;

            // Saturating conversion to u64 (truncates after ~584 million years)
            let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

            match &result {
                Ok(()) if ctx.is_cancelled() => info!(elapsed_ms, "request cancelled"),
                Ok(()) => match level {
                    LogLevel::Debug => debug!(data = ?ctx.state().data, elapsed_ms, "request completed"),
                    LogLevel::Info => info!(elapsed_ms, "request completed"),
                },
                Err(err) => warn!(error = %err, elapsed_ms, "request failed"),
            }

            result
        }
        .instrument(span)
        .boxed()
    }
}
