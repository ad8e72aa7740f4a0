//! State shared across request slots.
//!
//! Everything that is process-wide in spirit (the SWR cache, the in-flight
//! token refresh, focus/reconnect/visibility listeners) lives in a [`Runtime`]
//! that engines share by handle. Tests build their own runtime and never see
//! each other's state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, Shared};
use http::Extensions;
use sluice_core::{KeyManager, Result, lock};
use tracing::trace;

/// A token refresh shared by every slot waiting on it.
pub type SharedRefresh = Shared<BoxFuture<'static, Result<()>>>;

type Listener = Arc<dyn Fn() + Send + Sync>;
type VisibilityListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Host capabilities the refresh middleware depends on.
pub trait Environment: Send + Sync {
    /// Returns `true` if the host page or window is hidden.
    fn is_hidden(&self) -> bool {
        false
    }

    /// Returns `true` if the host has network connectivity.
    fn is_online(&self) -> bool {
        true
    }
}

/// An always visible, always online host.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEnvironment;

impl Environment for DefaultEnvironment {}

#[derive(Default)]
struct Listeners {
    focus: HashMap<u64, Listener>,
    reconnect: HashMap<u64, Listener>,
    visibility: HashMap<u64, VisibilityListener>,
}

struct RuntimeInner {
    keys: KeyManager,
    next_slot: AtomicU64,
    registry: Mutex<Extensions>,
    refresh_token: Mutex<Option<SharedRefresh>>,
    listeners: Mutex<Listeners>,
    environment: Arc<dyn Environment>,
}

/// Cross-slot state, cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = lock(&self.inner.listeners);
        f.debug_struct("Runtime")
            .field("next_key", &self.inner.keys.current_key())
            .field("focus_listeners", &listeners.focus.len())
            .field("reconnect_listeners", &listeners.reconnect.len())
            .field("visibility_listeners", &listeners.visibility.len())
            .finish_non_exhaustive()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create a runtime for a visible, online host.
    #[must_use]
    pub fn new() -> Self {
        Self::with_environment(DefaultEnvironment)
    }

    /// Create a runtime with custom host capabilities.
    #[must_use]
    pub fn with_environment(environment: impl Environment + 'static) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                keys: KeyManager::new(),
                next_slot: AtomicU64::new(0),
                registry: Mutex::new(Extensions::new()),
                refresh_token: Mutex::new(None),
                listeners: Mutex::new(Listeners::default()),
                environment: Arc::new(environment),
            }),
        }
    }

    /// Generator of keys for slots created without one.
    #[must_use]
    pub fn keys(&self) -> &KeyManager {
        &self.inner.keys
    }

    /// Host capabilities.
    #[must_use]
    pub fn environment(&self) -> &dyn Environment {
        self.inner.environment.as_ref()
    }

    pub(crate) fn next_slot_id(&self) -> u64 {
        self.inner.next_slot.fetch_add(1, Ordering::SeqCst)
    }

    /// The shared singleton of type `V`, created on first use.
    ///
    /// `V` should be a handle (an `Arc` inside) so every caller sees the same
    /// state.
    pub fn shared<V>(&self) -> V
    where
        V: Clone + Default + Send + Sync + 'static,
    {
        lock(&self.inner.registry).get_or_insert_default::<V>().clone()
    }

    /// The token refresh currently in flight, if any.
    #[must_use]
    pub fn refresh_in_flight(&self) -> Option<SharedRefresh> {
        lock(&self.inner.refresh_token).clone()
    }

    /// The in-flight token refresh, or the one `start` creates.
    pub fn refresh_or_start(&self, start: impl FnOnce() -> SharedRefresh) -> SharedRefresh {
        lock(&self.inner.refresh_token)
            .get_or_insert_with(start)
            .clone()
    }

    /// Forget `refresh` if it is still the one in flight.
    pub fn finish_refresh(&self, refresh: &SharedRefresh) {
        let mut current = lock(&self.inner.refresh_token);
        if current.as_ref().is_some_and(|running| running.ptr_eq(refresh)) {
            *current = None;
        }
    }

    /// Call `listener` when the host gains focus.
    pub fn on_focus(&self, slot: u64, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.listeners)
            .focus
            .insert(slot, Arc::new(listener));
    }

    /// Remove the focus listener of `slot`.
    pub fn off_focus(&self, slot: u64) {
        lock(&self.inner.listeners).focus.remove(&slot);
    }

    /// Call `listener` when the host reconnects.
    pub fn on_reconnect(&self, slot: u64, listener: impl Fn() + Send + Sync + 'static) {
        lock(&self.inner.listeners)
            .reconnect
            .insert(slot, Arc::new(listener));
    }

    /// Remove the reconnect listener of `slot`.
    pub fn off_reconnect(&self, slot: u64) {
        lock(&self.inner.listeners).reconnect.remove(&slot);
    }

    /// Call `listener` with the hidden flag when visibility changes.
    pub fn on_visibility(&self, slot: u64, listener: impl Fn(bool) + Send + Sync + 'static) {
        lock(&self.inner.listeners)
            .visibility
            .insert(slot, Arc::new(listener));
    }

    /// Remove the visibility listener of `slot`.
    pub fn off_visibility(&self, slot: u64) {
        lock(&self.inner.listeners).visibility.remove(&slot);
    }

    /// Returns `true` if `slot` listens to focus events.
    #[must_use]
    pub fn has_focus_listener(&self, slot: u64) -> bool {
        lock(&self.inner.listeners).focus.contains_key(&slot)
    }

    /// Returns `true` if `slot` listens to reconnect events.
    #[must_use]
    pub fn has_reconnect_listener(&self, slot: u64) -> bool {
        lock(&self.inner.listeners).reconnect.contains_key(&slot)
    }

    /// Returns `true` if `slot` listens to visibility events.
    #[must_use]
    pub fn has_visibility_listener(&self, slot: u64) -> bool {
        lock(&self.inner.listeners).visibility.contains_key(&slot)
    }

    /// Tell every focus listener that the host gained focus.
    pub fn notify_focus(&self) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .focus
            .values()
            .cloned()
            .collect();
        trace!(listeners = listeners.len(), "focus");
        for listener in listeners {
            listener();
        }
    }

    /// Tell every reconnect listener that the host is back online.
    ///
    /// Ignored while the environment reports the host offline.
    pub fn notify_reconnect(&self) {
        if !self.environment().is_online() {
            return;
        }
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .reconnect
            .values()
            .cloned()
            .collect();
        trace!(listeners = listeners.len(), "reconnect");
        for listener in listeners {
            listener();
        }
    }

    /// Tell every visibility listener the new hidden flag.
    pub fn notify_visibility(&self, hidden: bool) {
        let listeners: Vec<VisibilityListener> = lock(&self.inner.listeners)
            .visibility
            .values()
            .cloned()
            .collect();
        trace!(listeners = listeners.len(), hidden, "visibility change");
        for listener in listeners {
            listener(hidden);
        }
    }
}
