//! Injectable time source.

use chrono::{DateTime, Utc};

/// Provides the current wall-clock time.
///
/// The engine reads time exclusively through this trait. Substituting the
/// clock at construction makes every timing decision (arming the dispatch
/// timer, deciding whether the head entry is due) deterministic in tests.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The default [`Clock`], backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
