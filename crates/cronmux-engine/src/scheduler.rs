//! The cronmux scheduling engine.
//!
//! A [`Scheduler`] multiplexes every registered task onto one dispatch
//! worker. The worker sleeps until the earliest pending firing, hands the
//! task to the injected [`Executor`], advances the entry to its next cron
//! occurrence, and re-arms. Runs that return a handle are recorded in the
//! running registry and awaited by detached waiters; total concurrency is
//! capped by a semaphore that closes on shutdown.
//!
//! # Locking
//!
//! One read/write lock guards the scheduled index, the running registry, and
//! the armed wake time as a single logical unit. The lock is never held
//! across executor invocation, limiter acquisition, handle awaiting, or
//! cancel calls.
//!
//! # Task lifecycle
//!
//! ```text
//! schedule --> pending --> dispatch --> executor --> (run in flight) --> done
//!                 ^                                        |
//!                 '-------- advance to next instant -------'
//! ```
//!
//! A task leaves the cycle on [`Scheduler::release`], which also cancels its
//! in-flight runs.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::executor::{ErrorHook, Executor, RunHandle, noop_error_hook};
use crate::index::{CronState, FireKey, ScheduledIndex};
use crate::registry::RunningRegistry;
use crate::{RunId, TaskId};

/// Default concurrency-limiter capacity.
pub const DEFAULT_MAX_OUTSTANDING: usize = 1 << 16;

/// How far ahead the timer is armed when nothing is scheduled.
const MAX_WAIT_HOURS: i64 = 1_000_000;

/// Upper bound on each cancel call issued while releasing a task.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sentinel arming instant used while the scheduled index is empty.
fn far_future(now: DateTime<Utc>) -> DateTime<Utc> {
    now + TimeDelta::hours(MAX_WAIT_HOURS)
}

// ---------------------------------------------------------------------------
// Cron expression handling
// ---------------------------------------------------------------------------

/// Normalize a cron expression to the 6/7-field format expected by the
/// `cron` crate. Standard 5-field input gets a `0` seconds field prepended.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Parse a cron expression, rejecting malformed input.
fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expr(expr);
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expression: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Least instant the schedule produces strictly after `after`, or `None`
/// when the schedule is exhausted before the horizon.
fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Construction-time options for [`Scheduler`].
///
/// Sensible defaults are provided via [`Default`]; individual fields are
/// customised fluently with the `with_*` setters.
#[derive(Clone)]
pub struct SchedulerConfig {
    on_error: ErrorHook,
    max_outstanding: usize,
    clock: Arc<dyn Clock>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            on_error: noop_error_hook(),
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            clock: Arc::new(SystemClock),
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a custom error hook.
    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(TaskId, RunId, DateTime<Utc>, &SchedulerError) -> bool + Send + Sync + 'static,
    {
        self.on_error = Arc::new(hook);
        self
    }

    /// Cap the number of outstanding runs.
    ///
    /// Default: **65 536**. A zero capacity could never dispatch and is
    /// clamped to one.
    pub fn with_max_outstanding(mut self, cap: usize) -> Self {
        self.max_outstanding = cap.clamp(1, Semaphore::MAX_PERMITS);
        self
    }

    /// Substitute the time source (primarily for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Mutable engine state guarded by the single engine lock.
struct State {
    index: ScheduledIndex,
    running: RunningRegistry,
    /// Instant the dispatch timer is armed for; far future when idle.
    when: DateTime<Utc>,
}

struct Inner {
    state: RwLock<State>,
    /// Counting semaphore capping in-flight runs. Closed on shutdown so a
    /// blocked acquisition bails out without dispatching.
    limiter: Arc<Semaphore>,
    /// Nudges the dispatch worker to recompute its sleep after the armed
    /// wake time moved. A stored permit costs one extra recompute at most.
    rearm: Notify,
    executor: Arc<dyn Executor>,
    on_error: ErrorHook,
    clock: Arc<dyn Clock>,
    stopped: AtomicBool,
}

/// In-memory cron-driven task scheduler.
///
/// The scheduler is cheaply cloneable and safe to share across threads and
/// async tasks. The schedule lives in memory only; nothing survives a
/// process restart.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    /// Build a scheduler around `executor` with default options and start
    /// its dispatch worker. Must be called within a tokio runtime.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self::with_config(executor, SchedulerConfig::default())
    }

    /// Build a scheduler with explicit options and start its dispatch
    /// worker. Must be called within a tokio runtime.
    pub fn with_config(executor: Arc<dyn Executor>, config: SchedulerConfig) -> Self {
        let now = config.clock.now();
        let inner = Arc::new(Inner {
            state: RwLock::new(State {
                index: ScheduledIndex::new(),
                running: RunningRegistry::new(),
                when: far_future(now),
            }),
            limiter: Arc::new(Semaphore::new(config.max_outstanding)),
            rearm: Notify::new(),
            executor,
            on_error: config.on_error,
            clock: config.clock,
            stopped: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = tokio::spawn(Inner::dispatch_loop(Arc::clone(&inner), shutdown_rx));

        Self {
            inner,
            shutdown_tx,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Register `task` under `expr`, or replace its existing registration.
    ///
    /// The first firing is the schedule's least instant strictly after
    /// `since`, shifted by `offset`; each subsequent firing advances from
    /// the previous nominal instant, so the offset shifts execution without
    /// changing the cron phase. The armed wake time is recomputed from the
    /// new index minimum, so replacing the head task re-arms the dispatch
    /// timer in either direction.
    pub async fn schedule(
        &self,
        task: TaskId,
        expr: &str,
        offset: Duration,
        since: DateTime<Utc>,
    ) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(SchedulerError::Stopped);
        }
        let schedule = parse_schedule(expr)?;
        let offset = TimeDelta::from_std(offset)
            .map_err(|e| SchedulerError::InvalidOffset { reason: e.to_string() })?;
        let Some(first) = next_occurrence(&schedule, since) else {
            return Err(SchedulerError::NoFutureFiring { task_id: task });
        };
        let fire_at = first + offset;

        {
            let mut state = self.inner.state.write().await;
            state.index.upsert(task, fire_at, CronState { schedule, offset });
            let head = state
                .index
                .next_fire()
                .unwrap_or_else(|| far_future(self.inner.clock.now()));
            if head != state.when {
                state.when = head;
                self.inner.rearm.notify_one();
            }
            debug_assert!(state.index.in_lockstep());
        }

        info!(task_id = task, cron = expr, fire_at = %fire_at, "task scheduled");
        Ok(())
    }

    /// Deregister `task` and cancel every run of it still in flight.
    ///
    /// Unknown tasks are ignored. Each cancel call is bounded by a 30 s
    /// timeout; cancellation is advisory and the run's waiter sees the run
    /// through to completion either way.
    pub async fn release(&self, task: TaskId) {
        if self.inner.stopped.load(Ordering::Acquire) {
            return;
        }
        let cancelled = {
            let mut state = self.inner.state.write().await;
            let removed = state.index.remove(task);
            let handles = state.running.drain_task(task);
            if removed {
                state.when = state
                    .index
                    .next_fire()
                    .unwrap_or_else(|| far_future(self.inner.clock.now()));
                self.inner.rearm.notify_one();
            }
            debug_assert!(state.index.in_lockstep());
            if removed || !handles.is_empty() {
                info!(task_id = task, in_flight = handles.len(), "task released");
            }
            handles
        };

        for (run, handle) in cancelled {
            if time::timeout(CANCEL_TIMEOUT, handle.cancel()).await.is_err() {
                warn!(task_id = task, run_id = run, "cancel timed out");
            }
        }
    }

    /// Snapshot of run ids currently in flight for `task`, ascending, at
    /// most `limit` entries.
    pub async fn runs(&self, task: TaskId, limit: usize) -> Vec<RunId> {
        self.inner.state.read().await.running.list(task, limit)
    }

    /// The instant the dispatch timer is currently armed for. Far future
    /// when nothing is scheduled.
    pub async fn when(&self) -> DateTime<Utc> {
        self.inner.state.read().await.when
    }

    /// Snapshot of registered tasks and their next firing instants,
    /// ascending by fire time.
    pub async fn scheduled(&self) -> Vec<(TaskId, DateTime<Utc>)> {
        self.inner.state.read().await.index.snapshot()
    }

    /// Number of registered tasks.
    pub async fn scheduled_len(&self) -> usize {
        self.inner.state.read().await.index.len()
    }

    /// Shut the engine down.
    ///
    /// Signals the dispatch worker, closes the concurrency limiter so no
    /// further run can start, and waits for every spawned waiter to drain.
    /// Outstanding runs are not cancelled; they complete naturally. After
    /// `stop` returns the schedule is frozen: [`Scheduler::schedule`]
    /// reports [`SchedulerError::Stopped`] and [`Scheduler::release`] is a
    /// no-op.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        // Closing here, not just on loop exit, reaches a dispatch that is
        // parked on the limiter and would otherwise outlive the signal.
        self.inner.limiter.close();

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatch worker panicked during shutdown");
            }
        }
        info!("scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

impl Inner {
    /// The single long-lived dispatch worker.
    ///
    /// Sleeps until the armed wake time, then fires the earliest due entry.
    /// A re-arm nudge restarts the sleep with a fresh deadline; completed
    /// waiters are reaped as they finish. On shutdown the limiter is closed
    /// and the remaining waiters are drained to natural completion.
    async fn dispatch_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
        info!("dispatch worker started");
        let mut waiters: JoinSet<()> = JoinSet::new();

        loop {
            let wake_at = inner.state.read().await.when;
            let now = inner.clock.now();
            let sleep_for = (wake_at - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = inner.rearm.notified() => continue,
                Some(joined) = waiters.join_next(), if !waiters.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "run waiter panicked");
                    }
                }
                _ = time::sleep(sleep_for) => {
                    if !Inner::fire_due(&inner, &mut waiters).await {
                        break;
                    }
                }
            }
        }

        // No further dispatch: a closed limiter makes any in-progress
        // acquisition bail out without running.
        inner.limiter.close();
        while let Some(joined) = waiters.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "run waiter panicked");
            }
        }
        info!("dispatch worker stopped");
    }

    /// One timer firing: dispatch the earliest due entry, if any.
    ///
    /// Returns `false` when the limiter was closed underneath a blocked
    /// acquisition, which is the shutdown signal for the caller.
    async fn fire_due(inner: &Arc<Inner>, waiters: &mut JoinSet<()>) -> bool {
        let now = inner.clock.now();

        let (fired, job) = {
            let mut state = inner.state.write().await;
            let Some((key, job)) = state.index.peek_min() else {
                state.when = far_future(now);
                return true;
            };
            if key.fire_at > now {
                // Woken early; arm precisely for the head.
                state.when = key.fire_at;
                return true;
            }
            (key, job.clone())
        };

        // One permit per firing, taken before the executor is even invoked:
        // a full limiter blocks dispatch right here, throttling further
        // firings until a run completes.
        let permit = match Arc::clone(&inner.limiter).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return false,
        };

        debug!(task_id = fired.task_id, fire_at = %fired.fire_at, "dispatching task");
        let launched = inner.executor.execute(fired.task_id, fired.fire_at).await;

        // Successor instant, computed from the nominal (offset-free) point.
        let nominal = fired.fire_at - job.offset;
        let next = match next_occurrence(&job.schedule, nominal) {
            Some(next_nominal) => FireKey {
                fire_at: next_nominal + job.offset,
                ..fired
            },
            None => {
                // Park the entry far in the future under a bumped nonce: the
                // task stays visible until the hook owner releases it, but it
                // must not hold the due minimum, where it would be re-popped
                // every iteration and starve every other task.
                let err = SchedulerError::NoFutureFiring { task_id: fired.task_id };
                warn!(task_id = fired.task_id, "cron schedule yields no future instant");
                (inner.on_error)(fired.task_id, 0, fired.fire_at, &err);
                FireKey {
                    fire_at: far_future(now),
                    nonce: fired.nonce + 1,
                    ..fired
                }
            }
        };

        let (handle, sync_err) = match launched {
            Ok(handle) => (handle, None),
            Err(source) => (
                None,
                Some(SchedulerError::ExecutorFailed {
                    task_id: fired.task_id,
                    source,
                }),
            ),
        };

        // Reinsert half of the cycle. `advance` drops the reinsert if the
        // task was released or replaced while the executor ran; `live`
        // distinguishes released (cancel the fresh run) from replaced (the
        // task is still with us, keep the run).
        let live = {
            let mut state = inner.state.write().await;
            let advanced = state.index.advance(fired, next);
            let live = advanced || state.index.contains(fired.task_id);
            if live {
                if let Some(handle) = &handle {
                    state
                        .running
                        .insert(fired.task_id, handle.run_id(), Arc::clone(handle));
                }
            }
            state.when = state
                .index
                .next_fire()
                .unwrap_or_else(|| far_future(inner.clock.now()));
            debug_assert!(state.index.in_lockstep());
            live
        };

        match handle {
            Some(handle) => {
                Inner::spawn_waiter(inner, waiters, handle, permit, fired, !live);
            }
            None => {
                if let Some(err) = sync_err {
                    warn!(task_id = fired.task_id, error = %err, "executor rejected firing");
                    (inner.on_error)(fired.task_id, 0, fired.fire_at, &err);
                }
                drop(permit);
            }
        }
        true
    }

    /// Detached waiter for one in-flight run.
    ///
    /// Owns the limiter permit for the run's whole lifetime; dropping it at
    /// the end is what lets the next blocked dispatch proceed.
    fn spawn_waiter(
        inner: &Arc<Inner>,
        waiters: &mut JoinSet<()>,
        handle: Arc<dyn RunHandle>,
        permit: OwnedSemaphorePermit,
        fired: FireKey,
        released: bool,
    ) {
        let inner = Arc::clone(inner);
        let task = fired.task_id;
        let run = handle.run_id();
        waiters.spawn(async move {
            let _permit = permit;
            if released {
                // The task was released while this firing was in flight; the
                // registry never saw the run, so cancel it from here.
                if time::timeout(CANCEL_TIMEOUT, handle.cancel()).await.is_err() {
                    warn!(task_id = task, run_id = run, "cancel timed out");
                }
            }
            let result = handle.wait().await;
            {
                let mut state = inner.state.write().await;
                state.running.remove(task, run);
            }
            match result {
                Ok(()) => debug!(task_id = task, run_id = run, "run completed"),
                Err(source) => {
                    let err = SchedulerError::RunFailed {
                        task_id: task,
                        run_id: run,
                        source,
                    };
                    warn!(task_id = task, run_id = run, error = %err, "run failed");
                    (inner.on_error)(task, run, fired.fire_at, &err);
                }
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
