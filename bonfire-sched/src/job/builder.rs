use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    retry::{InvalidRetryPolicy, RetryPolicy},
    schedule::{InvalidSchedule, Schedule},
    ConcurrencyPolicy, InvocationTarget, MisfirePolicy,
};

/// Why a [`JobDefinition`] was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidDefinition {
    #[error(transparent)]
    Schedule(#[from] InvalidSchedule),
    #[error("invalid retry policy: {0}")]
    Retry(#[from] InvalidRetryPolicy),
}

/// The default group for jobs created without one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// The caller controlled description of a job, used for both creating and updating jobs.
///
/// # Example
///
/// ```
/// # use bonfire_sched::prelude::*;
/// let definition = JobDefinition::new("nightly-report", "0 0 2 * * *", "report")
///     .with_group("reports")
///     .with_params(serde_json::json!({ "format": "pdf" }))
///     .with_concurrency_policy(ConcurrencyPolicy::ForbidConcurrent)
///     .with_misfire_policy(MisfirePolicy::Skip);
///
/// assert!(definition.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default = "default_group")]
    pub group: String,
    pub schedule: String,
    pub target: InvocationTarget,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub misfire_policy: MisfirePolicy,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

fn default_group() -> String {
    DEFAULT_GROUP.to_owned()
}

impl JobDefinition {
    pub fn new(
        name: impl Into<String>,
        schedule: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            group: default_group(),
            schedule: schedule.into(),
            target: InvocationTarget::new(handler),
            concurrency_policy: Default::default(),
            misfire_policy: Default::default(),
            retry: None,
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn with_group(self, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..self
        }
    }

    pub fn with_schedule(self, schedule: impl Into<String>) -> Self {
        Self {
            schedule: schedule.into(),
            ..self
        }
    }

    pub fn with_target(self, target: InvocationTarget) -> Self {
        Self { target, ..self }
    }

    pub fn with_params(self, params: serde_json::Value) -> Self {
        Self {
            target: self.target.with_params(params),
            ..self
        }
    }

    pub fn with_concurrency_policy(self, concurrency_policy: ConcurrencyPolicy) -> Self {
        Self {
            concurrency_policy,
            ..self
        }
    }

    pub fn with_misfire_policy(self, misfire_policy: MisfirePolicy) -> Self {
        Self {
            misfire_policy,
            ..self
        }
    }

    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self {
            retry: Some(retry),
            ..self
        }
    }

    /// Check the schedule expression and the retry policy, returning the parsed [`Schedule`].
    ///
    /// Stores must call this before persisting a definition; an invalid expression is rejected
    /// and never coerced into something that parses.
    pub fn validate(&self) -> Result<Schedule, InvalidDefinition> {
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(Schedule::parse(&self.schedule)?)
    }
}
