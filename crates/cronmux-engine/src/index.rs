//! Ordered index of pending task firings.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::TaskId;

/// Total ordering key for a pending firing.
///
/// Lexicographic over `(fire_at, nonce, task_id)`: earliest instant first,
/// the nonce separating re-keyed retries of the same registration, the task
/// id making the order total. Two tasks due at the same second therefore
/// dispatch back-to-back in ascending task order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct FireKey {
    pub fire_at: DateTime<Utc>,
    pub nonce: u64,
    pub task_id: TaskId,
}

/// Per-task cron state carried alongside the ordering key.
#[derive(Debug, Clone)]
pub(crate) struct CronState {
    /// Parsed schedule. Owned per entry, never shared between tasks.
    pub schedule: Schedule,
    /// Shift applied to every nominal instant the schedule produces.
    pub offset: TimeDelta,
}

/// Priority structure over pending firings.
///
/// A `BTreeMap` ordered by [`FireKey`] holds the entries; a side map from
/// task id to current key supports keyed removal and upsert without
/// re-deriving the key from the cron expression. The two are mutated in
/// lockstep: every registered task appears in both, exactly once.
#[derive(Debug, Default)]
pub(crate) struct ScheduledIndex {
    tree: BTreeMap<FireKey, CronState>,
    by_task: HashMap<TaskId, FireKey>,
}

impl ScheduledIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` or replace its existing entry. Never duplicates: a
    /// previous entry is removed through the side map first. The nonce
    /// restarts at zero.
    pub fn upsert(&mut self, task: TaskId, fire_at: DateTime<Utc>, state: CronState) {
        if let Some(old) = self.by_task.remove(&task) {
            self.tree.remove(&old);
        }
        let key = FireKey {
            fire_at,
            nonce: 0,
            task_id: task,
        };
        self.by_task.insert(task, key);
        self.tree.insert(key, state);
    }

    /// Remove the entry for `task`, if any. Returns whether one existed.
    pub fn remove(&mut self, task: TaskId) -> bool {
        match self.by_task.remove(&task) {
            Some(key) => self.tree.remove(&key).is_some(),
            None => false,
        }
    }

    /// The least entry without removing it.
    pub fn peek_min(&self) -> Option<(FireKey, &CronState)> {
        self.tree.first_key_value().map(|(key, state)| (*key, state))
    }

    /// Earliest pending instant, if any.
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.tree.first_key_value().map(|(key, _)| key.fire_at)
    }

    /// Move the entry dispatched under `fired` to its successor key.
    ///
    /// This is the reinsert half of a dispatch cycle, and it is guarded: it
    /// applies only while the side map still binds the task to `fired`. A
    /// release (task gone) or re-registration (key replaced) that happened
    /// while the executor ran wins, and the stale reinsert is dropped.
    /// Returns whether the entry advanced.
    pub fn advance(&mut self, fired: FireKey, next: FireKey) -> bool {
        debug_assert_eq!(fired.task_id, next.task_id);
        match self.by_task.get(&fired.task_id) {
            Some(current) if *current == fired => {}
            _ => return false,
        }
        let Some(state) = self.tree.remove(&fired) else {
            return false;
        };
        self.by_task.insert(next.task_id, next);
        self.tree.insert(next, state);
        true
    }

    /// Whether `task` is registered.
    pub fn contains(&self, task: TaskId) -> bool {
        self.by_task.contains_key(&task)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Snapshot of `(task, next fire)` pairs, ascending by fire time.
    pub fn snapshot(&self) -> Vec<(TaskId, DateTime<Utc>)> {
        self.tree.keys().map(|key| (key.task_id, key.fire_at)).collect()
    }

    /// True when the tree and the side map agree entry-for-entry.
    pub fn in_lockstep(&self) -> bool {
        self.tree.len() == self.by_task.len()
            && self
                .tree
                .keys()
                .all(|key| self.by_task.get(&key.task_id) == Some(key))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
