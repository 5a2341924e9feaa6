//! Runtime configuration of a [`crate::Scheduler`].
use std::time::Duration;

use chrono::TimeDelta;

/// Tunables for the trigger engine and the worker pool.
///
/// # Example
///
/// ```
/// # use bonfire_sched::prelude::*;
/// # use chrono::TimeDelta;
/// # use std::time::Duration;
/// let config = SchedulerConfig::default()
///     .with_max_concurrency(4)
///     .with_misfire_threshold(TimeDelta::seconds(30))
///     .with_max_catch_up(10)
///     .with_reconcile_interval(Some(Duration::from_secs(300)));
///
/// assert_eq!(config.max_concurrency(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    max_concurrency: usize,
    misfire_threshold: TimeDelta,
    max_catch_up: usize,
    reconcile_interval: Option<Duration>,
}

impl SchedulerConfig {
    pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
    pub const DEFAULT_MISFIRE_THRESHOLD: TimeDelta = TimeDelta::seconds(60);
    pub const DEFAULT_MAX_CATCH_UP: usize = 100;

    pub const fn new() -> Self {
        Self {
            max_concurrency: Self::DEFAULT_MAX_CONCURRENCY,
            misfire_threshold: Self::DEFAULT_MISFIRE_THRESHOLD,
            max_catch_up: Self::DEFAULT_MAX_CATCH_UP,
            reconcile_interval: None,
        }
    }

    /// The number of handler invocations that may run at the same time.
    pub const fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..self
        }
    }

    /// How late a fire may be before it is treated as a misfire.
    pub const fn with_misfire_threshold(self, misfire_threshold: TimeDelta) -> Self {
        Self {
            misfire_threshold,
            ..self
        }
    }

    /// The maximum number of missed occurrences fired for [`crate::job::MisfirePolicy::Ignore`].
    pub const fn with_max_catch_up(self, max_catch_up: usize) -> Self {
        Self {
            max_catch_up,
            ..self
        }
    }

    /// Periodically align live timers with the job store. Disabled by default.
    pub const fn with_reconcile_interval(self, reconcile_interval: Option<Duration>) -> Self {
        Self {
            reconcile_interval,
            ..self
        }
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub const fn misfire_threshold(&self) -> TimeDelta {
        self.misfire_threshold
    }

    pub const fn max_catch_up(&self) -> usize {
        self.max_catch_up
    }

    pub const fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}
