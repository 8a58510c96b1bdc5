//! Recoverable error surface.
//!
//! Most misuse described in the scheduler's contract (double `start()`,
//! cyclic parenting) is a programmer error and unreachable through the typed
//! builder API, so it panics rather than returning a `Result` — see
//! `SPEC_FULL.md` §7. The variants below are the subset of misuse a caller
//! can hit through ordinary control flow.

use thiserror::Error;

/// Errors a caller can observe through the public API.
#[derive(Debug, Error)]
pub enum GroveError {
    /// `Service::child_task` (or a `Mutex` `*_child_task` variant) was called
    /// from a thread that is not currently executing a task.
    #[error("child_task called outside of a running task")]
    NoCurrentTask,

    /// `start()` was called after the owning `Service` began shutting down.
    #[error("service is shutting down, task was not scheduled")]
    ServiceShuttingDown,
}
