//! Prelude module for convenient imports.
//!
//! ```ignore
//! use sluice_core::prelude::*;
//! ```

pub use crate::{
    Data, DataParser, Error, Executor, Fetcher, Hook, KeyManager, Params, RequestState, Result,
    StatePatch, Store, Switch,
};
