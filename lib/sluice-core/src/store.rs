//! Typed key/value storage for middleware-private state.
//!
//! Each value type is its own key, so two middleware never collide as long as
//! they keep their state in private types.

use std::sync::Mutex;

use http::Extensions;

use crate::lock;

/// A lazily initialized, type-keyed map.
///
/// Values are cloned out on read; store `Arc`s or other shared handles when a
/// middleware needs to mutate state in place across calls.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<Extensions>,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the value of type `V`.
    pub fn set<V>(&self, value: V)
    where
        V: Clone + Send + Sync + 'static,
    {
        lock(&self.inner).insert(value);
    }

    /// Read the value of type `V`, initializing it with `V::default()` first.
    pub fn get<V>(&self) -> V
    where
        V: Clone + Default + Send + Sync + 'static,
    {
        lock(&self.inner).get_or_insert_default::<V>().clone()
    }

    /// Read the value of type `V` without initializing it.
    #[must_use]
    pub fn try_get<V>(&self) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        lock(&self.inner).get::<V>().cloned()
    }

    /// Mutate the value of type `V` in place, initializing it first if needed.
    pub fn update<V, R>(&self, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Clone + Default + Send + Sync + 'static,
    {
        f(lock(&self.inner).get_or_insert_default::<V>())
    }

    /// Remove and return the value of type `V`.
    pub fn remove<V>(&self) -> Option<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        lock(&self.inner).remove::<V>()
    }

    /// Drop every value.
    pub fn clear(&self) {
        lock(&self.inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter(u32);

    #[derive(Debug, Clone, PartialEq)]
    struct Label(&'static str);

    #[test]
    fn get_initializes_lazily() {
        let store = Store::new();
        assert_eq!(store.try_get::<Counter>(), None);
        assert_eq!(store.get::<Counter>(), Counter(0));
        assert_eq!(store.try_get::<Counter>(), Some(Counter(0)));
    }

    #[test]
    fn values_are_keyed_by_type() {
        let store = Store::new();
        store.set(Counter(3));
        store.set(Label("swr"));

        store.update(|counter: &mut Counter| counter.0 += 1);

        assert_eq!(store.get::<Counter>(), Counter(4));
        assert_eq!(store.try_get::<Label>(), Some(Label("swr")));
    }

    #[test]
    fn clear_drops_everything() {
        let store = Store::new();
        store.set(Counter(1));
        assert_eq!(store.remove::<Counter>(), Some(Counter(1)));
        store.set(Counter(2));
        store.clear();
        assert_eq!(store.try_get::<Counter>(), None);
    }
}
