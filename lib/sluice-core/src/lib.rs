//! Core primitives for the sluice request execution engine.
//!
//! This crate provides the building blocks the engine is made of:
//! - [`Error`] and [`Result`] - Error handling
//! - [`KeyManager`] - Generated request keys
//! - [`Switch`] - One-shot or repeatable boolean latches
//! - [`Store`] - Type-keyed storage for middleware-private state
//! - [`Hook`] - Named, ordered, async-aware pub/sub
//! - [`RequestState`] and [`StatePatch`] - Visible request state
//! - [`Fetcher`], [`Executor`], [`DataParser`] - Function types of an execution

use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod error;
mod fetcher;
mod hook;
mod key;
pub mod prelude;
mod state;
mod store;
mod switch;

pub use error::{Error, Result};
pub use fetcher::{DataParser, Executor, Fetcher};
pub use hook::{Hook, HookFuture, Unsubscribe};
pub use key::KeyManager;
pub use state::{RequestState, StatePatch};
pub use store::Store;
pub use switch::Switch;

/// Bound for the data a request produces.
///
/// Implemented for every type that is cloneable, comparable and shareable
/// across tasks.
pub trait Data: Clone + PartialEq + Debug + Send + Sync + 'static {}

impl<T> Data for T where T: Clone + PartialEq + Debug + Send + Sync + 'static {}

/// Bound for the parameters a request is run with.
pub trait Params: Clone + Default + Debug + Send + Sync + 'static {}

impl<P> Params for P where P: Clone + Default + Debug + Send + Sync + 'static {}

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
