//! String-keyed persistent storage for cached data.

use std::collections::HashMap;
use std::sync::Mutex;

use sluice_core::{Result, lock};

/// A string key/value store, in the shape of a browser `localStorage`.
pub trait Storage: Send + Sync {
    /// Read an item.
    fn get_item(&self, key: &str) -> Option<String>;

    /// Write an item.
    fn set_item(&self, key: &str, value: String) -> Result<()>;

    /// Delete an item.
    fn remove_item(&self, key: &str);
}

/// In-memory [`Storage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) -> Result<()> {
        lock(&self.items).insert(key.to_string(), value);
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        lock(&self.items).remove(key);
    }
}
