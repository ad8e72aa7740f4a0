//! The hooks every request slot exposes.

use sluice_core::{Data, Error, Hook, Params, RequestState, StatePatch};

use crate::context::{BasicContext, Context};

/// Named lifecycle events of a request slot.
///
/// Each field is an independent [`Hook`]. Execution hooks are awaited serially
/// by the engine, `state_change` and `loading_change` are fired synchronously.
pub struct RequestHooks<T, P> {
    /// Before any state mutation; cancel the context to veto the run.
    pub preface: Hook<(P, Context<T, P>)>,
    /// Parameters committed and error cleared.
    pub before: Hook<(P, Context<T, P>)>,
    /// The execution produced data.
    pub success: Hook<(Option<T>, Context<T, P>)>,
    /// The execution failed.
    pub error: Hook<(Error, Context<T, P>)>,
    /// After success or error, never after cancellation.
    pub after: Hook<(RequestState<T, P>, Context<T, P>)>,
    /// Always, last.
    pub finally: Hook<Context<T, P>>,
    /// The execution was cancelled.
    pub cancel: Hook<(RequestState<T, P>, Context<T, P>)>,
    /// A fetch result arrived after its execution was cancelled.
    pub discarded: Hook<Context<T, P>>,
    /// The slot is being disposed.
    pub dispose: Hook<BasicContext<T, P>>,
    /// Visible state changed.
    pub state_change: Hook<(StatePatch<T, P>, BasicContext<T, P>)>,
    /// Visible loading flag flipped.
    pub loading_change: Hook<(bool, BasicContext<T, P>)>,
    /// A retry attempt is about to start.
    pub retry_progress: Hook<(u32, Context<T, P>)>,
    /// A retry attempt succeeded.
    pub retry_success: Hook<(T, Context<T, P>)>,
    /// Every retry attempt failed.
    pub retry_fail: Hook<(Error, Context<T, P>)>,
    /// Another slot sharing this key produced new data.
    pub sync_data: Hook<(Option<T>, BasicContext<T, P>)>,
}

impl<T, P> std::fmt::Debug for RequestHooks<T, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHooks").finish_non_exhaustive()
    }
}

impl<T: Data, P: Params> Default for RequestHooks<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Data, P: Params> RequestHooks<T, P> {
    /// Create hooks with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self {
            preface: Hook::new("preface"),
            before: Hook::new("before"),
            success: Hook::new("success"),
            error: Hook::new("error"),
            after: Hook::new("after"),
            finally: Hook::new("finally"),
            cancel: Hook::new("cancel"),
            discarded: Hook::new("discarded"),
            dispose: Hook::new("dispose"),
            state_change: Hook::new("stateChange"),
            loading_change: Hook::new("loadingChange"),
            retry_progress: Hook::new("retry:progress"),
            retry_success: Hook::new("retry:success"),
            retry_fail: Hook::new("retry:fail"),
            sync_data: Hook::new("swr:syncData"),
        }
    }

    /// Remove every callback from every hook.
    pub fn clear(&self) {
        self.preface.clear();
        self.before.clear();
        self.success.clear();
        self.error.clear();
        self.after.clear();
        self.finally.clear();
        self.cancel.clear();
        self.discarded.clear();
        self.dispose.clear();
        self.state_change.clear();
        self.loading_change.clear();
        self.retry_progress.clear();
        self.retry_success.clear();
        self.retry_fail.clear();
        self.sync_data.clear();
    }
}
