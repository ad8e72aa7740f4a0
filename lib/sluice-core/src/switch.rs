//! Boolean latches used for cancel, failure and dispose flags.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock;

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

/// A boolean latch with transition callbacks.
///
/// A repeatable switch can be flipped any number of times. A one-shot switch
/// (see [`Switch::once`]) accepts a single transition and ignores every later
/// request, which makes `open()` on it naturally idempotent.
pub struct Switch {
    on: AtomicBool,
    once: bool,
    used: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("on", &self.is_on())
            .field("once", &self.once)
            .finish_non_exhaustive()
    }
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

impl Switch {
    /// Create a repeatable switch, initially off.
    #[must_use]
    pub fn new() -> Self {
        Self {
            on: AtomicBool::new(false),
            once: false,
            used: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Create a one-shot switch, initially off.
    #[must_use]
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::new()
        }
    }

    /// Returns `true` if the switch is on.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Turn the switch on. Returns `true` if this call changed its state.
    pub fn open(&self) -> bool {
        self.set(true)
    }

    /// Turn the switch off. Returns `true` if this call changed its state.
    pub fn close(&self) -> bool {
        self.set(false)
    }

    /// Flip the switch. Returns `true` if this call changed its state.
    pub fn toggle(&self) -> bool {
        self.set(!self.is_on())
    }

    /// Register a callback invoked with the new value after each transition.
    ///
    /// Returns an id for [`off`](Self::off).
    pub fn on_toggle(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a callback registered with [`on_toggle`](Self::on_toggle).
    pub fn off(&self, id: u64) {
        lock(&self.listeners).retain(|(listener_id, _)| *listener_id != id);
    }

    fn set(&self, value: bool) -> bool {
        if self.once && self.used.load(Ordering::SeqCst) {
            return false;
        }
        if self
            .on
            .compare_exchange(!value, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.once {
            self.used.store(true, Ordering::SeqCst);
        }

        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(value);
        }
        true
    }
}
