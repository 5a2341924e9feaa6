//! The API for configuring the execution history pruner.
//!
//! Execution records are never cascade deleted with their job, so a long running scheduler keeps
//! accumulating history. [`PrunerConfig`] sets up a cron scheduled clean up made of one or more
//! [`Pruner`]s, each removing finalized records either older than a given age or beyond a given
//! number of records per job.
//!
//! Running records are never pruned.
//!
//! # Example
//!
//! To keep a week of successful and skipped runs, while keeping the last 50 failures of every
//! job:
//!
//! ```
//! # use bonfire_sched::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_max_concurrency(Some(2))
//!     .with_pruner(
//!         Pruner::max_age(TimeDelta::days(7))
//!             .only(ExecutionOutcome::Succeeded)
//!             .and(ExecutionOutcome::Skipped),
//!     )
//!     .with_pruner(Pruner::max_length(50).only(ExecutionOutcome::Failed));
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

use crate::execution::ExecutionOutcome;

/// Configuration of the history pruner: when it runs and what it removes.
///
/// Once constructed, it should be passed to [`crate::Scheduler::with_pruner`].
pub struct PrunerConfig {
    schedule: cron::Schedule,
    max_concurrency: Option<usize>,
    pruners: Vec<PruneSpec>,
}

impl PrunerConfig {
    /// Construct a new instance of [`PrunerConfig`] scheduled to run on the provided cron
    /// schedule.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_concurrency: Some(10),
            pruners: Default::default(),
        }
    }

    /// Specify the maximum number of pruners that should be ran simultaneously.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Add a single [`Pruner`] to the config.
    pub fn with_pruner(mut self, pruner: Pruner) -> Self {
        self.pruners.push(pruner.into());
        self
    }

    /// Add multiple [`Pruner`]s to the config.
    pub fn with_pruners(mut self, pruners: impl IntoIterator<Item = Pruner>) -> Self {
        self.pruners.extend(pruners.into_iter().map(Into::into));
        self
    }
}

/// The specification of a single pruner for consumption by the [`crate::backend::ExecutionLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneSpec {
    /// The final outcomes of the records affected by this pruner.
    pub outcomes: Vec<ExecutionOutcome>,
    /// The particular pruning strategy to apply, either max length or max age.
    pub prune_by: PruneBy,
}

impl From<Pruner> for PruneSpec {
    fn from(value: Pruner) -> Self {
        let outcomes = if value.outcomes.is_empty() {
            ExecutionOutcome::ALL
                .into_iter()
                .filter(|outcome| outcome.is_final())
                .collect()
        } else {
            value.outcomes
        };
        Self {
            outcomes,
            prune_by: value.prune_by,
        }
    }
}

/// Configuration for a single pruner.
///
/// By default a pruner applies to records of every final outcome; use [`Pruner::only`] and
/// [`Pruner::and`] to narrow it down.
pub struct Pruner {
    prune_by: PruneBy,
    outcomes: Vec<ExecutionOutcome>,
}

impl Pruner {
    /// Constructs a pruner removing records fired longer ago than `age`.
    pub const fn max_age(age: TimeDelta) -> Self {
        Self {
            prune_by: PruneBy::MaxAge(age),
            outcomes: Vec::new(),
        }
    }

    /// Constructs a pruner keeping at most `length` matching records per job.
    pub const fn max_length(length: u32) -> Self {
        Self {
            prune_by: PruneBy::MaxLength(length),
            outcomes: Vec::new(),
        }
    }

    /// Restrict this pruner to records with the given outcome.
    pub fn only(mut self, outcome: ExecutionOutcome) -> Self {
        self.outcomes = vec![outcome];
        self
    }

    /// Additionally prune records with the given outcome.
    pub fn and(mut self, outcome: ExecutionOutcome) -> Self {
        self.outcomes.push(outcome);
        self
    }
}

/// The strategy to prune by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    /// Remove records fired longer ago than the given [`TimeDelta`].
    MaxAge(TimeDelta),
    /// Keep only the given number of most recent records per job.
    MaxLength(u32),
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn config() {
        let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
            .with_pruner(Pruner::max_age(TimeDelta::days(31)))
            .with_pruners([
                Pruner::max_length(200).only(ExecutionOutcome::Failed),
                Pruner::max_length(10).only(ExecutionOutcome::Skipped),
            ]);

        assert_eq!(config.pruners.len(), 3);
    }

    #[test]
    fn default_outcomes_exclude_running() {
        let spec = PruneSpec::from(Pruner::max_length(5));
        assert_eq!(
            spec.outcomes,
            vec![
                ExecutionOutcome::Succeeded,
                ExecutionOutcome::Failed,
                ExecutionOutcome::Skipped
            ]
        );
    }

    #[test]
    fn only_and() {
        let spec = PruneSpec::from(
            Pruner::max_age(TimeDelta::days(1))
                .only(ExecutionOutcome::Failed)
                .and(ExecutionOutcome::Skipped),
        );
        assert_eq!(
            spec.outcomes,
            vec![ExecutionOutcome::Failed, ExecutionOutcome::Skipped]
        );
        assert_eq!(spec.prune_by, PruneBy::MaxAge(TimeDelta::days(1)));
    }
}
