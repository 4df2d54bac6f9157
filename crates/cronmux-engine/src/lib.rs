//! cronmux scheduling engine.
//!
//! An in-memory, cron-driven task scheduler: one dispatch worker multiplexes
//! an unbounded catalog of recurring tasks over a single re-armable timer,
//! hands each firing to an injected [`Executor`], tracks the resulting
//! in-flight runs so they can be cancelled, and caps total concurrency with a
//! closing semaphore.
//!
//! - **[`scheduler`]** -- The [`Scheduler`] engine: registration surface,
//!   dispatch loop, and run waiters.
//! - **[`executor`]** -- The [`Executor`] / [`RunHandle`] contracts the engine
//!   drives, plus the [`ErrorHook`] failures are reported through.
//! - **[`clock`]** -- Injectable [`Clock`] time source so timing-sensitive
//!   code stays deterministic under test.
//! - **[`error`]** -- Unified engine error types via [`thiserror`].
//!
//! The schedule lives in memory only: there is no durability across restart
//! and no catch-up for firings missed while the process was down.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod clock;
pub mod error;
pub mod executor;
pub mod scheduler;

mod index;
mod registry;

/// Caller-supplied task identifier. Total-ordered; ties between tasks due at
/// the same instant dispatch in ascending `TaskId` order.
pub type TaskId = u64;

/// Executor-produced run identifier, unique within a task. Zero is reserved
/// for failures that happen before a run exists.
pub type RunId = u64;

// Re-export the most commonly used types at the crate root for convenience.
pub use clock::{Clock, SystemClock};
pub use error::{Result, SchedulerError};
pub use executor::{ErrorHook, Executor, RunError, RunHandle};
pub use scheduler::{DEFAULT_MAX_OUTSTANDING, Scheduler, SchedulerConfig};
