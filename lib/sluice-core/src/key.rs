//! Generated request keys.

use std::sync::atomic::{AtomicU64, Ordering};

/// Generates unique keys for request slots created without an explicit key.
///
/// Keys look like `__0`, `__1`, … and are unique per manager, so each engine
/// owns one.
#[derive(Debug, Default)]
pub struct KeyManager {
    count: AtomicU64,
}

impl KeyManager {
    /// Create a new key manager starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Format a counter value as a key.
    #[must_use]
    pub fn to_key(value: u64) -> String {
        format!("__{value}")
    }

    /// Return the next key and advance the counter.
    pub fn next_key(&self) -> String {
        Self::to_key(self.count.fetch_add(1, Ordering::SeqCst))
    }

    /// Return the key the next call to [`next_key`](Self::next_key) will produce.
    #[must_use]
    pub fn current_key(&self) -> String {
        Self::to_key(self.count.load(Ordering::SeqCst))
    }
}
