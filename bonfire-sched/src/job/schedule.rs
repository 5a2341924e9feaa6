//! Parsing and evaluation of schedule expressions.
//!
//! Expressions use the [`cron`] crate syntax: six fields (`sec min hour day month weekday`) with
//! an optional seventh year field, or one of the `@hourly`/`@daily`/... shortcuts. Classic five
//! field expressions (`min hour day month weekday`) are accepted as well and fire on second zero.
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A schedule expression which failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid schedule expression `{expression}`: {reason}")]
pub struct InvalidSchedule {
    pub expression: String,
    pub reason: String,
}

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    inner: cron::Schedule,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, InvalidSchedule> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_owned(),
        };
        let inner = cron::Schedule::from_str(&normalized).map_err(|err| InvalidSchedule {
            expression: expression.to_owned(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_owned(),
            inner,
        })
    }

    /// The expression as it was given.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The first occurrence strictly after `after`, or [`None`] if the schedule has no further
    /// occurrences.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(after).next()
    }

    /// Whether `at` is an occurrence of the schedule.
    pub fn includes(&self, at: &DateTime<Utc>) -> bool {
        self.next_after(&(*at - chrono::TimeDelta::seconds(1))).as_ref() == Some(at)
    }

    /// The occurrences in `from..=until`, in order, at most `limit` of them.
    pub fn occurrences_between(
        &self,
        from: &DateTime<Utc>,
        until: &DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        // `after` is exclusive so step back by the smallest unit the schedule can express.
        let start = *from - chrono::TimeDelta::seconds(1);
        self.inner
            .after(&start)
            .skip_while(|occurrence| occurrence < from)
            .take_while(|occurrence| occurrence <= until)
            .take(limit)
            .collect()
    }
}

impl FromStr for Schedule {
    type Err = InvalidSchedule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for Schedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Schedule {}
