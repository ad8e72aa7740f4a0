//! Middleware-driven request execution engine.
//!
//! An [`Engine`] turns a fetcher into request slots. Every execution of a slot
//! runs through an ordered middleware chain and a set of lifecycle hooks, so
//! caching, retries, polling and token refresh are added without touching the
//! fetcher itself.
//!
//! # Example
//!
//! ```ignore
//! use sluice::prelude::*;
//! use sluice::middleware::{Retry, RetryCount, RetryOptions};
//!
//! let engine: Engine<User, u64> = Engine::new(
//!     RequestOptions::builder().middleware(Retry::default()),
//! );
//!
//! let user = engine.request(
//!     Fetcher::new(|id: u64| async move { api::get_user(id).await }),
//!     RequestOptions::builder().with(RetryOptions::new().count(RetryCount::Limited(3))),
//! );
//!
//! let data = user.run(42).await?;
//! ```
//!
//! # Shared state
//!
//! Slots created by engines on the same [`Runtime`] share the SWR cache, the
//! in-flight token refresh and the focus/reconnect listeners.

mod context;
mod engine;
mod hooks;
pub mod middleware;
mod options;
mod pending;
pub mod prelude;
mod runtime;
#[cfg(feature = "middleware-swr")]
mod storage;

// Re-export core types
pub use sluice_core::{
    Data, DataParser, Error, Executor, Fetcher, Hook, HookFuture, KeyManager, Params,
    RequestState, Result, StatePatch, Store, Switch, Unsubscribe, lock,
};

pub use context::{BasicContext, Context, WeakBasicContext, WeakContext};
pub use engine::{Engine, Request};
pub use hooks::RequestHooks;
pub use options::{
    DEFAULT_LOADING_DELAY, DataCalibrator, DataComparer, HookInstaller, IgnorePattern, InitData,
    KeyGenerator, ReadyFn, RequestOptions, RequestOptionsBuilder, SingleFn,
};
pub use pending::PendingManager;
pub use runtime::{DefaultEnvironment, Environment, Runtime, SharedRefresh};
#[cfg(feature = "middleware-swr")]
pub use storage::{MemoryStorage, Storage};
