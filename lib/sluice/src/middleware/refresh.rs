//! Polling and event-driven refresh middleware.
//!
//! Refreshes a slot on an interval after each success, and optionally when
//! the host regains focus or connectivity. Host events arrive through the
//! [`Runtime`](crate::Runtime) notifiers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_core::{Data, Params, lock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Middleware, RetryCount, RetryOptions};
use crate::context::{BasicContext, Context, WeakBasicContext};

/// Options of the [`Refresh`] middleware.
///
/// Polling is enabled only when `interval` is non-zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOptions {
    when_focus: Option<bool>,
    when_hidden: Option<bool>,
    when_reconnect: Option<bool>,
    when_offline: Option<bool>,
    interval: Option<Duration>,
    error_retry_count: Option<RetryCount>,
}

impl RefreshOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh when the host gains focus.
    #[must_use]
    pub fn when_focus(mut self, enabled: bool) -> Self {
        self.when_focus = Some(enabled);
        self
    }

    /// Keep polling while the host is hidden.
    #[must_use]
    pub fn when_hidden(mut self, enabled: bool) -> Self {
        self.when_hidden = Some(enabled);
        self
    }

    /// Refresh when the host reconnects.
    #[must_use]
    pub fn when_reconnect(mut self, enabled: bool) -> Self {
        self.when_reconnect = Some(enabled);
        self
    }

    /// Keep polling while the host is offline.
    #[must_use]
    pub fn when_offline(mut self, enabled: bool) -> Self {
        self.when_offline = Some(enabled);
        self
    }

    /// Delay between a success and the next poll.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Retry budget of polled executions, unless the request sets its own.
    #[must_use]
    pub fn error_retry_count(mut self, count: RetryCount) -> Self {
        self.error_retry_count = Some(count);
        self
    }

    /// Overlay `other` on `self`; fields set in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            when_focus: other.when_focus.or(self.when_focus),
            when_hidden: other.when_hidden.or(self.when_hidden),
            when_reconnect: other.when_reconnect.or(self.when_reconnect),
            when_offline: other.when_offline.or(self.when_offline),
            interval: other.interval.or(self.interval),
            error_retry_count: other.error_retry_count.or(self.error_retry_count),
        }
    }

    fn resolve(self) -> Settings {
        Settings {
            when_focus: self.when_focus.unwrap_or(false),
            when_hidden: self.when_hidden.unwrap_or(false),
            when_reconnect: self.when_reconnect.unwrap_or(false),
            when_offline: self.when_offline.unwrap_or(false),
            interval: self.interval.unwrap_or_default(),
            error_retry_count: self.error_retry_count.unwrap_or(RetryCount::Unlimited),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    when_focus: bool,
    when_hidden: bool,
    when_reconnect: bool,
    when_offline: bool,
    interval: Duration,
    error_retry_count: RetryCount,
}

/// Whether a slot is polling, exposed with `Request::result_ext`.
#[derive(Debug, Clone, Default)]
pub struct PollingStatus(Arc<AtomicBool>);

impl PollingStatus {
    /// Returns `true` while the poll timer is armed.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, polling: bool) {
        self.0.store(polling, Ordering::SeqCst);
    }
}

/// Per-execution marker set on `before`.
#[derive(Debug, Clone, Copy)]
struct PollingDisabled(bool);

fn polling_enabled<T: Data, P: Params>(ctx: &Context<T, P>) -> bool {
    ctx.local()
        .try_get::<PollingDisabled>()
        .is_some_and(|disabled| !disabled.0)
}

fn spawn_refresh<T: Data, P: Params>(slot: &WeakBasicContext<T, P>) {
    let Some(ctx) = slot.upgrade() else {
        return;
    };
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(key = %ctx.key(), "no runtime available, refresh skipped");
        return;
    };
    let key = ctx.key().to_string();
    let refresh = ctx.refresh();
    handle.spawn(async move {
        if let Err(err) = refresh.await {
            warn!(%key, error = %err, "refresh failed");
        }
    });
}

/// Single-shot poll timer.
#[derive(Clone)]
struct PollTimer<T, P> {
    slot: WeakBasicContext<T, P>,
    interval: Duration,
    status: PollingStatus,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<T: Data, P: Params> PollTimer<T, P> {
    fn start(&self) {
        self.status.set(true);
        let slot = self.slot.clone();
        let interval = self.interval;
        // The tick hands the refresh to its own task, so restarting the timer
        // from `success` never aborts a running execution.
        let tick = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            spawn_refresh(&slot);
        });
        if let Some(previous) = lock(&self.handle).replace(tick) {
            previous.abort();
        }
    }

    fn stop(&self) {
        self.status.set(false);
        if let Some(tick) = lock(&self.handle).take() {
            tick.abort();
        }
    }

    fn restart_now(&self) {
        self.status.set(true);
        spawn_refresh(&self.slot);
    }
}

/// Polling and focus/reconnect refresh middleware.
#[derive(Debug, Clone, Default)]
pub struct Refresh {
    defaults: RefreshOptions,
}

impl Refresh {
    /// Create the middleware with default options.
    #[must_use]
    pub fn new(defaults: RefreshOptions) -> Self {
        Self { defaults }
    }
}

impl<T: Data, P: Params> Middleware<T, P> for Refresh {
    fn name(&self) -> Option<&str> {
        Some("basic:refresh")
    }

    fn priority(&self) -> i32 {
        -999
    }

    #[allow(clippy::too_many_lines)]
    fn setup(&self, ctx: &BasicContext<T, P>) {
        let bag = ctx.options().get::<RefreshOptions>().copied().unwrap_or_default();
        let settings = self.defaults.merge(bag).resolve();
        let raw_retry = ctx.options().get::<RetryOptions>().cloned();

        let status = PollingStatus::default();
        ctx.mutate_result(status.clone());
        let timer = PollTimer {
            slot: ctx.downgrade(),
            interval: settings.interval,
            status,
            handle: Arc::new(Mutex::new(None)),
        };

        let visibility = {
            let timer = timer.clone();
            move |hidden: bool| {
                if settings.when_hidden {
                    return;
                }
                if hidden {
                    timer.stop();
                } else {
                    timer.restart_now();
                }
            }
        };

        let _ = ctx.hooks().before.on_sync(move |(_, ctx)| {
            let runtime = ctx.runtime();
            let id = ctx.basic().id();
            if settings.when_focus {
                let slot = ctx.basic().downgrade();
                runtime.on_focus(id, move || spawn_refresh(&slot));
            } else {
                runtime.off_focus(id);
            }
            if settings.when_reconnect {
                let slot = ctx.basic().downgrade();
                runtime.on_reconnect(id, move || spawn_refresh(&slot));
            } else {
                runtime.off_reconnect(id);
            }

            let disabled = settings.interval.is_zero();
            ctx.local().set(PollingDisabled(disabled));
            if !disabled {
                runtime.on_visibility(id, visibility.clone());
            }

            let raw_retry = raw_retry.clone();
            ctx.mutate_options(|options| match (disabled, raw_retry) {
                (true, Some(raw)) => options.insert(raw),
                (true, None) => {
                    options.remove::<RetryOptions>();
                }
                (false, raw) => options.insert(
                    RetryOptions::new()
                        .count(settings.error_retry_count)
                        .merge(raw.unwrap_or_default()),
                ),
            });
        });

        let _ = ctx.hooks().retry_fail.on_sync(|(_, ctx)| {
            if polling_enabled(ctx) {
                ctx.runtime().off_visibility(ctx.basic().id());
            }
        });

        let cancel_timer = timer.clone();
        let _ = ctx.hooks().cancel.on_sync(move |(_, ctx)| {
            if polling_enabled(ctx) {
                cancel_timer.stop();
                ctx.runtime().off_visibility(ctx.basic().id());
            }
        });

        let success_timer = timer.clone();
        let _ = ctx.hooks().success.on_sync(move |(_, ctx)| {
            if !polling_enabled(ctx) {
                return;
            }
            let environment = ctx.runtime().environment();
            if !settings.when_hidden && environment.is_hidden() {
                return;
            }
            if !environment.is_online() && !settings.when_offline {
                debug!(key = %ctx.key(), "offline, polling paused");
                success_timer.status.set(false);
                return;
            }
            success_timer.start();
        });

        let _ = ctx.hooks().dispose.once_sync(move |ctx| {
            timer.stop();
            let runtime = ctx.runtime();
            runtime.off_focus(ctx.id());
            runtime.off_reconnect(ctx.id());
            runtime.off_visibility(ctx.id());
        });
    }
}
