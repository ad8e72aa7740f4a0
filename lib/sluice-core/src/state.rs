//! Request state and state patches.

use crate::Error;

/// The visible state of a request slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestState<T, P> {
    /// Parameters of the last execution.
    pub params: P,
    /// Last successfully parsed data.
    pub data: Option<T>,
    /// Last error.
    pub error: Option<Error>,
    /// Whether an execution is in flight.
    ///
    /// Shared by every overlapping execution of the slot.
    pub loading: bool,
}

impl<T, P: Default> RequestState<T, P> {
    /// Create a state holding the initial data.
    #[must_use]
    pub fn new(data: Option<T>) -> Self {
        Self {
            params: P::default(),
            data,
            error: None,
            loading: false,
        }
    }
}

impl<T, P: Default> Default for RequestState<T, P> {
    fn default() -> Self {
        Self::new(None)
    }
}

/// A shallow update of [`RequestState`].
///
/// Only the fields that are `Some` are written. The patch is also what the
/// `stateChange` hook receives, so listeners see exactly what changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StatePatch<T, P> {
    /// New parameters.
    pub params: Option<P>,
    /// New data (`Some(None)` clears it).
    pub data: Option<Option<T>>,
    /// New error (`Some(None)` clears it).
    pub error: Option<Option<Error>>,
    /// New loading flag.
    pub loading: Option<bool>,
}

impl<T, P> Default for StatePatch<T, P> {
    fn default() -> Self {
        Self {
            params: None,
            data: None,
            error: None,
            loading: None,
        }
    }
}

impl<T: Clone, P: Clone> StatePatch<T, P> {
    /// Create an empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the parameters.
    #[must_use]
    pub fn params(mut self, params: P) -> Self {
        self.params = Some(params);
        self
    }

    /// Set the data.
    #[must_use]
    pub fn data(mut self, data: Option<T>) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the error.
    #[must_use]
    pub fn error(mut self, error: Option<Error>) -> Self {
        self.error = Some(error);
        self
    }

    /// Set the loading flag.
    #[must_use]
    pub fn loading(mut self, loading: bool) -> Self {
        self.loading = Some(loading);
        self
    }

    /// Returns `true` if the patch writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_none() && self.data.is_none() && self.error.is_none() && self.loading.is_none()
    }

    /// Write the patch into `state`.
    pub fn apply(&self, state: &mut RequestState<T, P>) {
        if let Some(params) = &self.params {
            state.params = params.clone();
        }
        if let Some(data) = &self.data {
            state.data = data.clone();
        }
        if let Some(error) = &self.error {
            state.error = error.clone();
        }
        if let Some(loading) = self.loading {
            state.loading = loading;
        }
    }
}
