//! Debounce and throttle middleware.
//!
//! Both replace the slot executor at setup, so they decide whether `run`
//! starts an execution at all. Calls that are deferred or dropped by the gate
//! resolve right away with the current data.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use sluice_core::{Data, Executor, Params, Result, lock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use super::Middleware;
use crate::context::BasicContext;

/// Timing of a gate, in the shape of lodash `debounce`.
#[derive(Debug, Clone, Copy)]
struct GateSettings {
    wait: Duration,
    max_wait: Option<Duration>,
    leading: bool,
    trailing: bool,
}

struct GateState<P> {
    last_params: Option<P>,
    last_call: Option<Instant>,
    last_invoke: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

/// Rate limiter in front of an executor.
struct Gate<P> {
    name: &'static str,
    settings: GateSettings,
    target: Executor<P>,
    state: Mutex<GateState<P>>,
}

impl<P: Params> Gate<P> {
    fn new(name: &'static str, settings: GateSettings, target: Executor<P>) -> Arc<Self> {
        Arc::new(Self {
            name,
            settings,
            target,
            state: Mutex::new(GateState {
                last_params: None,
                last_call: None,
                last_invoke: None,
                timer: None,
            }),
        })
    }

    fn since_last_invoke(state: &GateState<P>, now: Instant) -> Duration {
        state
            .last_invoke
            .map_or(Duration::MAX, |last| now.saturating_duration_since(last))
    }

    fn should_invoke(&self, state: &GateState<P>, now: Instant) -> bool {
        let Some(last_call) = state.last_call else {
            return true;
        };
        now.saturating_duration_since(last_call) >= self.settings.wait
            || self
                .settings
                .max_wait
                .is_some_and(|max_wait| Self::since_last_invoke(state, now) >= max_wait)
    }

    fn remaining_wait(&self, state: &GateState<P>, now: Instant) -> Duration {
        let since_last_call = state
            .last_call
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        let waiting = self.settings.wait.saturating_sub(since_last_call);
        match self.settings.max_wait {
            Some(max_wait) => waiting.min(max_wait.saturating_sub(Self::since_last_invoke(state, now))),
            None => waiting,
        }
    }

    fn take_invocation(state: &mut GateState<P>, now: Instant) -> Option<P> {
        let params = state.last_params.take();
        if params.is_some() {
            state.last_invoke = Some(now);
        }
        params
    }

    fn start_timer(self: &Arc<Self>, state: &mut GateState<P>, delay: Duration) {
        let gate: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(gate) = gate.upgrade() else {
                return;
            };
            if let Some(params) = gate.expire() {
                trace!(gate = gate.name, "trailing call");
                if let Err(err) = gate.target.call(params).await {
                    warn!(gate = gate.name, error = %err, "trailing call failed");
                }
            }
        });
        if let Some(previous) = state.timer.replace(handle) {
            previous.abort();
        }
    }

    /// Timer callback. Returns the parameters of the trailing call, if any.
    fn expire(self: &Arc<Self>) -> Option<P> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        // The running timer is the caller; drop its handle without aborting it.
        state.timer = None;

        if !self.should_invoke(&state, now) {
            let remaining = self.remaining_wait(&state, now);
            self.start_timer(&mut state, remaining);
            return None;
        }

        let params = if self.settings.trailing {
            Self::take_invocation(&mut state, now)
        } else {
            None
        };
        state.last_params = None;
        params
    }

    fn call(self: &Arc<Self>, params: P) -> BoxFuture<'static, Result<()>> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let invoking = self.should_invoke(&state, now);
        state.last_params = Some(params);
        state.last_call = Some(now);

        let mut invocation = None;
        if invoking {
            if state.timer.is_none() {
                state.last_invoke = Some(now);
                self.start_timer(&mut state, self.settings.wait);
                if self.settings.leading {
                    invocation = Self::take_invocation(&mut state, now);
                }
            } else if self.settings.max_wait.is_some() {
                self.start_timer(&mut state, self.settings.wait);
                invocation = Self::take_invocation(&mut state, now);
            }
        }
        if state.timer.is_none() {
            self.start_timer(&mut state, self.settings.wait);
        }
        drop(state);

        match invocation {
            Some(params) => self.target.call(params),
            None => {
                trace!(gate = self.name, "call deferred");
                ready(Ok(())).boxed()
            }
        }
    }

    fn cancel(&self) {
        let mut state = lock(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.last_params = None;
        state.last_call = None;
        state.last_invoke = None;
    }
}

fn install<T: Data, P: Params>(ctx: &BasicContext<T, P>, name: &'static str, settings: GateSettings) {
    let gate = Gate::new(name, settings, ctx.executor());
    let cancelled = Arc::clone(&gate);
    let _ = ctx.hooks().cancel.on_sync(move |_| cancelled.cancel());
    ctx.set_executor(Executor::new(move |params: P| gate.call(params)));
}

/// Options of the [`Debounce`] middleware.
///
/// The gate is installed only when `wait` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebounceOptions {
    wait: Option<Duration>,
    max_wait: Option<Duration>,
    leading: Option<bool>,
    trailing: Option<bool>,
}

impl DebounceOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Quiet period before a call goes through.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Longest a call may be postponed.
    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Run on the leading edge (default `false`).
    #[must_use]
    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = Some(leading);
        self
    }

    /// Run on the trailing edge (default `true`).
    #[must_use]
    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = Some(trailing);
        self
    }

    /// Overlay `other` on `self`; fields set in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            wait: other.wait.or(self.wait),
            max_wait: other.max_wait.or(self.max_wait),
            leading: other.leading.or(self.leading),
            trailing: other.trailing.or(self.trailing),
        }
    }

    fn settings(self) -> Option<GateSettings> {
        let wait = self.wait?;
        Some(GateSettings {
            wait,
            max_wait: self.max_wait.map(|max_wait| max_wait.max(wait)),
            leading: self.leading.unwrap_or(false),
            trailing: self.trailing.unwrap_or(true),
        })
    }
}

/// Debounces `run`: only the last call of a burst goes through.
#[derive(Debug, Clone, Default)]
pub struct Debounce {
    defaults: DebounceOptions,
}

impl Debounce {
    /// Create the middleware with default options.
    #[must_use]
    pub fn new(defaults: DebounceOptions) -> Self {
        Self { defaults }
    }
}

impl<T: Data, P: Params> Middleware<T, P> for Debounce {
    fn name(&self) -> Option<&str> {
        Some("basic:debounce")
    }

    fn priority(&self) -> i32 {
        -1000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let bag = ctx.options().get::<DebounceOptions>().copied().unwrap_or_default();
        if let Some(settings) = self.defaults.merge(bag).settings() {
            install(ctx, "debounce", settings);
        }
    }
}

/// Options of the [`Throttle`] middleware.
///
/// The gate is installed only when `wait` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleOptions {
    wait: Option<Duration>,
    leading: Option<bool>,
    trailing: Option<bool>,
}

impl ThrottleOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one call per `wait`.
    #[must_use]
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Run on the leading edge (default `true`).
    #[must_use]
    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = Some(leading);
        self
    }

    /// Run on the trailing edge (default `true`).
    #[must_use]
    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = Some(trailing);
        self
    }

    /// Overlay `other` on `self`; fields set in `other` win.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            wait: other.wait.or(self.wait),
            leading: other.leading.or(self.leading),
            trailing: other.trailing.or(self.trailing),
        }
    }

    fn settings(self) -> Option<GateSettings> {
        let wait = self.wait?;
        Some(GateSettings {
            wait,
            max_wait: Some(wait),
            leading: self.leading.unwrap_or(true),
            trailing: self.trailing.unwrap_or(true),
        })
    }
}

/// Throttles `run`: at most one call per `wait`.
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    defaults: ThrottleOptions,
}

impl Throttle {
    /// Create the middleware with default options.
    #[must_use]
    pub fn new(defaults: ThrottleOptions) -> Self {
        Self { defaults }
    }
}

impl<T: Data, P: Params> Middleware<T, P> for Throttle {
    fn name(&self) -> Option<&str> {
        Some("basic:throttle")
    }

    fn priority(&self) -> i32 {
        -1000
    }

    fn setup(&self, ctx: &BasicContext<T, P>) {
        let bag = ctx.options().get::<ThrottleOptions>().copied().unwrap_or_default();
        if let Some(settings) = self.defaults.merge(bag).settings() {
            install(ctx, "throttle", settings);
        }
    }
}
