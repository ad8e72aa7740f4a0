//! Prelude module for convenient imports.
//!
//! ```ignore
//! use sluice::prelude::*;
//! ```

pub use crate::middleware::{Logging, Middleware, Next, from_fn};
pub use crate::{
    BasicContext, Context, DataParser, Engine, Error, Fetcher, Request, RequestHooks,
    RequestOptions, RequestState, Result, Runtime, StatePatch,
};
