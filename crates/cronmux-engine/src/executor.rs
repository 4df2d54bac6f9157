//! Contracts between the engine and the code it drives.
//!
//! The scheduler never runs task bodies itself. Each firing is handed to the
//! injected [`Executor`], which either rejects it, runs it fire-and-forget,
//! or returns a [`RunHandle`] that the engine records and awaits on a
//! detached waiter until the run completes or is cancelled.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::{RunId, TaskId};

/// Error type produced by executors and run handles.
pub type RunError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Launches task runs on behalf of the scheduler.
///
/// Implementations must be safe for concurrent invocation: several runs of
/// the same task may be started while earlier ones are still in flight,
/// bounded only by the engine's concurrency limiter.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Start one run of `task` for the firing instant `scheduled_for`.
    ///
    /// Return values:
    /// - `Ok(Some(handle))` -- the run started; the engine records it in the
    ///   running registry and awaits the handle.
    /// - `Ok(None)` -- fire-and-forget; nothing is recorded and the firing
    ///   cannot be cancelled.
    /// - `Err(_)` -- the firing did not start. Reported through the error
    ///   hook with a zero run id; the task stays scheduled at its next
    ///   instant.
    async fn execute(
        &self,
        task: TaskId,
        scheduled_for: DateTime<Utc>,
    ) -> std::result::Result<Option<Arc<dyn RunHandle>>, RunError>;
}

/// A single in-flight run produced by an [`Executor`].
#[async_trait]
pub trait RunHandle: Send + Sync {
    /// Identifier of this run, unique within its task.
    fn run_id(&self) -> RunId;

    /// Ask the run to stop. Advisory: the engine bounds each call with a
    /// 30 s timeout and does not wait for acknowledgement beyond that; how
    /// cancellation propagates is the executor's business.
    async fn cancel(&self);

    /// Resolves when the run finishes, however it finishes. `Err` means the
    /// run failed mid-flight and is reported through the error hook.
    async fn wait(&self) -> std::result::Result<(), RunError>;
}

/// Callback invoked whenever a firing or run fails.
///
/// Receives the task, the run (zero when no run was started), the firing
/// instant, and the error. Invoked for executor rejections, failed runs, and
/// schedules that cannot produce a future instant. The returned bool is
/// reserved for a future drop-task-on-repeated-failure policy; the engine
/// currently ignores it, so handlers that want a failing task gone should
/// call [`Scheduler::release`](crate::Scheduler::release) themselves.
pub type ErrorHook =
    Arc<dyn Fn(TaskId, RunId, DateTime<Utc>, &SchedulerError) -> bool + Send + Sync>;

/// The default hook: does nothing and keeps the task.
pub(crate) fn noop_error_hook() -> ErrorHook {
    Arc::new(|_, _, _, _| true)
}
