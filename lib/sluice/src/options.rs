//! Request configuration types.
//!
//! [`RequestOptions`] is the resolved configuration a slot runs with.
//! [`RequestOptionsBuilder`] collects overrides; the engine merges its global
//! builder with the per-request one and resolves defaults in
//! [`build`](RequestOptionsBuilder::build).

use std::sync::Arc;
use std::time::Duration;

use http::Extensions;
use regex::Regex;
use sluice_core::{Data, DataParser, Params};

use crate::hooks::RequestHooks;
use crate::middleware::Middleware;

/// Produces a key for slots created without one.
pub type KeyGenerator = Arc<dyn Fn() -> Option<String> + Send + Sync>;
/// Produces the initial data of a slot.
pub type InitData<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;
/// Synchronous adjustment applied after the data parser.
pub type DataCalibrator<T> = Arc<dyn Fn(T) -> T + Send + Sync>;
/// Equality used to decide whether new data should be broadcast.
pub type DataComparer<T> = Arc<dyn Fn(Option<&T>, Option<&T>) -> bool + Send + Sync>;
/// Decides whether an execution may start with the given parameters.
pub type ReadyFn<P> = Arc<dyn Fn(&P) -> bool + Send + Sync>;
/// Decides, from new and previous parameters, whether a run is single-flight.
pub type SingleFn<P> = Arc<dyn Fn(&P, &P) -> bool + Send + Sync>;
/// Registers callbacks on the hooks of a freshly created slot.
pub type HookInstaller<T, P> = Arc<dyn Fn(&RequestHooks<T, P>) + Send + Sync>;

/// Default delay before `loading` becomes visible.
pub const DEFAULT_LOADING_DELAY: Duration = Duration::from_millis(300);

/// A middleware name filter.
#[derive(Debug, Clone)]
pub enum IgnorePattern {
    /// Matches a single name exactly.
    Name(String),
    /// Matches every name the expression finds a match in.
    Regex(Regex),
}

impl IgnorePattern {
    /// Returns `true` if `name` is excluded by this pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Name(expected) => expected == name,
            Self::Regex(regex) => regex.is_match(name),
        }
    }
}

impl From<&str> for IgnorePattern {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for IgnorePattern {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<Regex> for IgnorePattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

/// Resolved configuration of a request slot.
pub struct RequestOptions<T, P> {
    /// Explicit slot key.
    pub key: Option<String>,
    /// Key generator used when no key is given.
    pub key_generator: Option<KeyGenerator>,
    /// Initial data.
    pub init_data: Option<InitData<T>>,
    /// Parameters used by the automatic first run.
    pub default_params: P,
    /// Async transformation of raw fetch results.
    pub data_parser: DataParser<T>,
    /// Synchronous adjustment applied after parsing.
    pub data_calibrator: Option<DataCalibrator<T>>,
    /// Data equality.
    pub data_comparer: DataComparer<T>,
    /// Keep the previous data while a new execution runs.
    pub keep_previous_data: bool,
    /// Reset data to the initial value when an execution fails.
    pub init_data_when_error: bool,
    /// Delay before `loading` becomes visible.
    pub loading_delay: Duration,
    /// Run once with the default parameters when the slot is created.
    pub immediate: bool,
    /// Readiness gate.
    pub ready: Option<ReadyFn<P>>,
    /// Single-flight predicate.
    pub single: Option<SingleFn<P>>,
    /// Cancel pending executions instead of skipping the new one.
    pub single_with_force: bool,
    /// Cancel the latest execution when the slot is disposed.
    pub cancel_when_dispose: bool,
    /// User middleware.
    pub middleware: Vec<Arc<dyn Middleware<T, P>>>,
    /// Hook installers.
    pub hooks: Vec<HookInstaller<T, P>>,
    /// Middleware excluded by name.
    pub ignore_middleware: Vec<IgnorePattern>,
    /// Middleware option bags, keyed by type.
    pub extensions: Extensions,
}

impl<T, P: Clone> Clone for RequestOptions<T, P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            key_generator: self.key_generator.clone(),
            init_data: self.init_data.clone(),
            default_params: self.default_params.clone(),
            data_parser: self.data_parser.clone(),
            data_calibrator: self.data_calibrator.clone(),
            data_comparer: Arc::clone(&self.data_comparer),
            keep_previous_data: self.keep_previous_data,
            init_data_when_error: self.init_data_when_error,
            loading_delay: self.loading_delay,
            immediate: self.immediate,
            ready: self.ready.clone(),
            single: self.single.clone(),
            single_with_force: self.single_with_force,
            cancel_when_dispose: self.cancel_when_dispose,
            middleware: self.middleware.clone(),
            hooks: self.hooks.clone(),
            ignore_middleware: self.ignore_middleware.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

impl<T, P: std::fmt::Debug> std::fmt::Debug for RequestOptions<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("key", &self.key)
            .field("default_params", &self.default_params)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("init_data_when_error", &self.init_data_when_error)
            .field("loading_delay", &self.loading_delay)
            .field("immediate", &self.immediate)
            .field("single_with_force", &self.single_with_force)
            .field("cancel_when_dispose", &self.cancel_when_dispose)
            .field("middleware", &self.middleware.len())
            .field("hooks", &self.hooks.len())
            .field("ignore_middleware", &self.ignore_middleware)
            .finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> Default for RequestOptions<T, P> {
    fn default() -> Self {
        RequestOptionsBuilder::default().build()
    }
}

impl<T: Data, P: Params> RequestOptions<T, P> {
    /// Create a new options builder.
    #[must_use]
    pub fn builder() -> RequestOptionsBuilder<T, P> {
        RequestOptionsBuilder::default()
    }

    /// Evaluate the initial data.
    #[must_use]
    pub fn init_data(&self) -> Option<T> {
        self.init_data.as_ref().and_then(|init| init())
    }

    /// Compare two data values with the configured comparer.
    #[must_use]
    pub fn same_data(&self, left: Option<&T>, right: Option<&T>) -> bool {
        (self.data_comparer)(left, right)
    }

    /// Returns `true` if an execution may start with `params`.
    #[must_use]
    pub fn is_ready(&self, params: &P) -> bool {
        self.ready.as_ref().is_none_or(|ready| ready(params))
    }

    /// Returns `true` if a run with `params` must not overlap pending ones.
    #[must_use]
    pub fn is_single(&self, params: &P, previous: &P) -> bool {
        self.single
            .as_ref()
            .is_some_and(|single| single(params, previous))
    }

    /// Returns `true` if a middleware with this name is excluded.
    #[must_use]
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore_middleware
            .iter()
            .any(|pattern| pattern.matches(name))
    }

    /// Read a middleware option bag.
    #[must_use]
    pub fn get<B>(&self) -> Option<&B>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.extensions.get::<B>()
    }

    /// Replace a middleware option bag.
    pub fn insert<B>(&mut self, bag: B)
    where
        B: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(bag);
    }

    /// Remove a middleware option bag.
    pub fn remove<B>(&mut self) -> Option<B>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.extensions.remove::<B>()
    }
}

/// Builder for [`RequestOptions`].
pub struct RequestOptionsBuilder<T, P> {
    key: Option<String>,
    key_generator: Option<KeyGenerator>,
    init_data: Option<InitData<T>>,
    default_params: Option<P>,
    data_parser: Option<DataParser<T>>,
    data_calibrator: Option<DataCalibrator<T>>,
    data_comparer: Option<DataComparer<T>>,
    keep_previous_data: Option<bool>,
    init_data_when_error: Option<bool>,
    loading_delay: Option<Duration>,
    immediate: Option<bool>,
    ready: Option<ReadyFn<P>>,
    single: Option<SingleFn<P>>,
    single_with_force: Option<bool>,
    cancel_when_dispose: Option<bool>,
    middleware: Vec<Arc<dyn Middleware<T, P>>>,
    hooks: Vec<HookInstaller<T, P>>,
    ignore_middleware: Vec<IgnorePattern>,
    extensions: Extensions,
}

impl<T, P> Default for RequestOptionsBuilder<T, P> {
    fn default() -> Self {
        Self {
            key: None,
            key_generator: None,
            init_data: None,
            default_params: None,
            data_parser: None,
            data_calibrator: None,
            data_comparer: None,
            keep_previous_data: None,
            init_data_when_error: None,
            loading_delay: None,
            immediate: None,
            ready: None,
            single: None,
            single_with_force: None,
            cancel_when_dispose: None,
            middleware: Vec::new(),
            hooks: Vec::new(),
            ignore_middleware: Vec::new(),
            extensions: Extensions::new(),
        }
    }
}

impl<T, P: Clone> Clone for RequestOptionsBuilder<T, P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            key_generator: self.key_generator.clone(),
            init_data: self.init_data.clone(),
            default_params: self.default_params.clone(),
            data_parser: self.data_parser.clone(),
            data_calibrator: self.data_calibrator.clone(),
            data_comparer: self.data_comparer.clone(),
            keep_previous_data: self.keep_previous_data,
            init_data_when_error: self.init_data_when_error,
            loading_delay: self.loading_delay,
            immediate: self.immediate,
            ready: self.ready.clone(),
            single: self.single.clone(),
            single_with_force: self.single_with_force,
            cancel_when_dispose: self.cancel_when_dispose,
            middleware: self.middleware.clone(),
            hooks: self.hooks.clone(),
            ignore_middleware: self.ignore_middleware.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

impl<T, P: std::fmt::Debug> std::fmt::Debug for RequestOptionsBuilder<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptionsBuilder")
            .field("key", &self.key)
            .field("default_params", &self.default_params)
            .field("middleware", &self.middleware.len())
            .field("hooks", &self.hooks.len())
            .field("ignore_middleware", &self.ignore_middleware)
            .finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> RequestOptionsBuilder<T, P> {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the slot key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the key generator.
    #[must_use]
    pub fn key_generator(mut self, generator: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    /// Set the initial data getter.
    #[must_use]
    pub fn init_data(mut self, init: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        self.init_data = Some(Arc::new(init));
        self
    }

    /// Set the default parameters.
    #[must_use]
    pub fn default_params(mut self, params: P) -> Self {
        self.default_params = Some(params);
        self
    }

    /// Set the data parser.
    #[must_use]
    pub fn data_parser(mut self, parser: DataParser<T>) -> Self {
        self.data_parser = Some(parser);
        self
    }

    /// Set the data calibrator.
    #[must_use]
    pub fn data_calibrator(mut self, calibrator: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.data_calibrator = Some(Arc::new(calibrator));
        self
    }

    /// Set the data comparer.
    #[must_use]
    pub fn data_comparer(
        mut self,
        comparer: impl Fn(Option<&T>, Option<&T>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.data_comparer = Some(Arc::new(comparer));
        self
    }

    /// Set whether previous data is kept while a new execution runs.
    #[must_use]
    pub const fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = Some(keep);
        self
    }

    /// Set whether data is reset to its initial value on failure.
    #[must_use]
    pub const fn init_data_when_error(mut self, reset: bool) -> Self {
        self.init_data_when_error = Some(reset);
        self
    }

    /// Set the loading delay.
    #[must_use]
    pub const fn loading_delay(mut self, delay: Duration) -> Self {
        self.loading_delay = Some(delay);
        self
    }

    /// Set whether the slot runs once when created.
    #[must_use]
    pub const fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    /// Set the readiness gate.
    #[must_use]
    pub fn ready(mut self, ready: impl Fn(&P) -> bool + Send + Sync + 'static) -> Self {
        self.ready = Some(Arc::new(ready));
        self
    }

    /// Set the single-flight predicate.
    #[must_use]
    pub fn single(mut self, single: impl Fn(&P, &P) -> bool + Send + Sync + 'static) -> Self {
        self.single = Some(Arc::new(single));
        self
    }

    /// Set whether single-flight cancels pending executions.
    #[must_use]
    pub const fn single_with_force(mut self, force: bool) -> Self {
        self.single_with_force = Some(force);
        self
    }

    /// Set whether dispose cancels the latest execution.
    #[must_use]
    pub const fn cancel_when_dispose(mut self, cancel: bool) -> Self {
        self.cancel_when_dispose = Some(cancel);
        self
    }

    /// Add a middleware.
    #[must_use]
    pub fn middleware(self, middleware: impl Middleware<T, P>) -> Self {
        self.middleware_arc(Arc::new(middleware))
    }

    /// Add a shared middleware.
    ///
    /// Adding the same `Arc` twice registers it once.
    #[must_use]
    pub fn middleware_arc(mut self, middleware: Arc<dyn Middleware<T, P>>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Add several shared middleware.
    #[must_use]
    pub fn middlewares(mut self, middleware: impl IntoIterator<Item = Arc<dyn Middleware<T, P>>>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    /// Add a hook installer.
    #[must_use]
    pub fn hooks(mut self, install: impl Fn(&RequestHooks<T, P>) + Send + Sync + 'static) -> Self {
        self.hooks.push(Arc::new(install));
        self
    }

    /// Exclude middleware by name or pattern.
    #[must_use]
    pub fn ignore_middleware(mut self, pattern: impl Into<IgnorePattern>) -> Self {
        self.ignore_middleware.push(pattern.into());
        self
    }

    /// Attach a middleware option bag.
    #[must_use]
    pub fn with<B>(mut self, bag: B) -> Self
    where
        B: Clone + Send + Sync + 'static,
    {
        self.extensions.insert(bag);
        self
    }

    /// Merge `other` over `self`.
    ///
    /// Values set in `other` win; middleware, hooks and ignore lists are
    /// concatenated with `self` first.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.key = other.key.or(self.key);
        self.key_generator = other.key_generator.or(self.key_generator);
        self.init_data = other.init_data.or(self.init_data);
        self.default_params = other.default_params.or(self.default_params);
        self.data_parser = other.data_parser.or(self.data_parser);
        self.data_calibrator = other.data_calibrator.or(self.data_calibrator);
        self.data_comparer = other.data_comparer.or(self.data_comparer);
        self.keep_previous_data = other.keep_previous_data.or(self.keep_previous_data);
        self.init_data_when_error = other.init_data_when_error.or(self.init_data_when_error);
        self.loading_delay = other.loading_delay.or(self.loading_delay);
        self.immediate = other.immediate.or(self.immediate);
        self.ready = other.ready.or(self.ready);
        self.single = other.single.or(self.single);
        self.single_with_force = other.single_with_force.or(self.single_with_force);
        self.cancel_when_dispose = other.cancel_when_dispose.or(self.cancel_when_dispose);
        self.middleware.extend(other.middleware);
        self.hooks.extend(other.hooks);
        self.ignore_middleware.extend(other.ignore_middleware);
        self.extensions.extend(other.extensions);
        self
    }

    /// Build the options, resolving defaults.
    #[must_use]
    pub fn build(self) -> RequestOptions<T, P> {
        RequestOptions {
            key: self.key,
            key_generator: self.key_generator,
            init_data: self.init_data,
            default_params: self.default_params.unwrap_or_default(),
            data_parser: self.data_parser.unwrap_or_default(),
            data_calibrator: self.data_calibrator,
            data_comparer: self
                .data_comparer
                .unwrap_or_else(|| Arc::new(|left: Option<&T>, right: Option<&T>| left == right)),
            keep_previous_data: self.keep_previous_data.unwrap_or(true),
            init_data_when_error: self.init_data_when_error.unwrap_or(true),
            loading_delay: self.loading_delay.unwrap_or(DEFAULT_LOADING_DELAY),
            immediate: self.immediate.unwrap_or(false),
            ready: self.ready,
            single: self.single,
            single_with_force: self.single_with_force.unwrap_or(false),
            cancel_when_dispose: self.cancel_when_dispose.unwrap_or(false),
            middleware: self.middleware,
            hooks: self.hooks,
            ignore_middleware: self.ignore_middleware,
            extensions: self.extensions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Bag(u32);

    #[test]
    fn default_options() {
        let options: RequestOptions<u32, ()> = RequestOptions::default();
        assert!(options.keep_previous_data);
        assert!(options.init_data_when_error);
        assert!(!options.immediate);
        assert!(!options.single_with_force);
        assert!(!options.cancel_when_dispose);
        assert_eq!(options.loading_delay, Duration::from_millis(300));
        assert_eq!(options.init_data(), None);
        assert!(options.is_ready(&()));
        assert!(!options.is_single(&(), &()));
        assert!(options.same_data(Some(&1), Some(&1)));
        assert!(!options.same_data(Some(&1), None));
    }

    #[test]
    fn builder_overrides() {
        let options: RequestOptions<u32, u32> = RequestOptions::builder()
            .key("users")
            .init_data(|| Some(7))
            .default_params(3)
            .keep_previous_data(false)
            .loading_delay(Duration::ZERO)
            .ready(|params| *params > 0)
            .build();

        assert_eq!(options.key.as_deref(), Some("users"));
        assert_eq!(options.init_data(), Some(7));
        assert_eq!(options.default_params, 3);
        assert!(!options.keep_previous_data);
        assert_eq!(options.loading_delay, Duration::ZERO);
        assert!(options.is_ready(&1));
        assert!(!options.is_ready(&0));
    }

    #[test]
    fn merge_prefers_later_values() {
        let global: RequestOptionsBuilder<u32, ()> = RequestOptionsBuilder::new()
            .key("global")
            .immediate(true)
            .with(Bag(1))
            .ignore_middleware("builtin:loading");
        let local = RequestOptionsBuilder::new()
            .key("local")
            .with(Bag(2))
            .ignore_middleware("builtin:error");

        let options = global.merge(local).build();
        assert_eq!(options.key.as_deref(), Some("local"));
        assert!(options.immediate);
        assert_eq!(options.get::<Bag>(), Some(&Bag(2)));
        assert!(options.is_ignored("builtin:loading"));
        assert!(options.is_ignored("builtin:error"));
        assert!(!options.is_ignored("builtin:ready"));
    }

    #[test]
    fn ignore_patterns() {
        let regex = Regex::new("^basic:").expect("regex");
        let options: RequestOptions<u32, ()> = RequestOptions::builder()
            .ignore_middleware(regex)
            .ignore_middleware("custom")
            .build();

        assert!(options.is_ignored("basic:retry"));
        assert!(options.is_ignored("custom"));
        assert!(!options.is_ignored("custom:other"));
        assert!(!options.is_ignored("builtin:ready"));
    }
}
