//! Index of in-flight runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::executor::RunHandle;
use crate::{RunId, TaskId};

/// In-flight runs keyed by `(task, run)`, ordered for per-task range scans.
///
/// A task may hold several live entries at once (a long-running prior run and
/// a newly dispatched one can coexist); the global ceiling is enforced by the
/// concurrency limiter, not here. The stored handle doubles as the run's
/// cancel function.
#[derive(Default)]
pub(crate) struct RunningRegistry {
    runs: BTreeMap<(TaskId, RunId), Arc<dyn RunHandle>>,
}

impl RunningRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: TaskId, run: RunId, handle: Arc<dyn RunHandle>) {
        self.runs.insert((task, run), handle);
    }

    pub fn remove(&mut self, task: TaskId, run: RunId) -> bool {
        self.runs.remove(&(task, run)).is_some()
    }

    /// Run ids in flight for `task`, ascending, at most `limit` entries.
    pub fn list(&self, task: TaskId, limit: usize) -> Vec<RunId> {
        self.runs
            .range((task, RunId::MIN)..=(task, RunId::MAX))
            .take(limit)
            .map(|((_, run), _)| *run)
            .collect()
    }

    /// Remove every entry for `task`, returning the handles so the caller
    /// can issue cancels without holding the engine lock.
    pub fn drain_task(&mut self, task: TaskId) -> Vec<(RunId, Arc<dyn RunHandle>)> {
        let keys: Vec<(TaskId, RunId)> = self
            .runs
            .range((task, RunId::MIN)..=(task, RunId::MAX))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.runs.remove(&key).map(|handle| (key.1, handle)))
            .collect()
    }

    /// Total number of in-flight runs across all tasks.
    pub fn len(&self) -> usize {
        self.runs.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
