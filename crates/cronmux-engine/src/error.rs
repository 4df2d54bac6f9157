//! Engine error types.
//!
//! Everything the engine can fail at surfaces through [`SchedulerError`].
//! Registration problems are returned synchronously from the public surface;
//! runtime failures (executor rejections, failed runs, exhausted schedules)
//! are reported through the configured [`ErrorHook`](crate::ErrorHook) and
//! never abort the engine or other tasks.

use crate::executor::RunError;
use crate::{RunId, TaskId};

/// Unified error type for the cronmux engine.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    // -- Registration errors ------------------------------------------------
    /// The cron expression could not be parsed. The task is not registered.
    #[error("invalid cron expression `{expression}`: {reason}")]
    InvalidCron {
        /// The expression as the caller supplied it, before normalization.
        expression: String,
        reason: String,
    },

    /// The firing offset is outside the representable range.
    #[error("invalid firing offset: {reason}")]
    InvalidOffset { reason: String },

    /// The scheduler has been stopped and no longer accepts registrations.
    #[error("scheduler is stopped")]
    Stopped,

    // -- Schedule advance ---------------------------------------------------
    /// The cron schedule yields no instant before the scheduling horizon.
    ///
    /// On registration this rejects the task; during dispatch it is reported
    /// through the error hook and the entry is parked far in the future so
    /// the hook owner can decide to release it.
    #[error("no firing instant for task {task_id} before the scheduling horizon")]
    NoFutureFiring { task_id: TaskId },

    // -- Run failures (reported through the error hook) ---------------------
    /// The executor returned an error before producing a handle; this firing
    /// never started. The task stays scheduled at its next instant.
    #[error("executor rejected the firing of task {task_id}: {source}")]
    ExecutorFailed {
        task_id: TaskId,
        #[source]
        source: RunError,
    },

    /// A run completed with an error after it had started.
    #[error("run {run_id} of task {task_id} failed: {source}")]
    RunFailed {
        task_id: TaskId,
        run_id: RunId,
        #[source]
        source: RunError,
    },
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;
