use bonfire_sched::{
    backend::BackendError,
    execution::{ExecutionOutcome, ExecutionRecord},
    job::{ConcurrencyPolicy, Job, JobStatus, MisfirePolicy},
};
use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;

pub(crate) const JOB_COLUMNS: &str = "id, name, job_group, schedule, target, status, \
    concurrency_policy, misfire_policy, retry, next_fire_at, created_at, updated_at";

pub(crate) const EXECUTION_COLUMNS: &str =
    "id, job_id, fired_at, completed_at, outcome, error_detail, attempts";

/// Stored as the codes `"0"` and `"1"`.
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    #[sqlx(rename = "0")]
    Active,
    #[sqlx(rename = "1")]
    Paused,
}

impl From<Status> for JobStatus {
    fn from(value: Status) -> Self {
        match value {
            Status::Active => Self::Active,
            Status::Paused => Self::Paused,
        }
    }
}

impl From<JobStatus> for Status {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Active => Self::Active,
            JobStatus::Paused => Self::Paused,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum Concurrency {
    Allow,
    Forbid,
}

impl From<Concurrency> for ConcurrencyPolicy {
    fn from(value: Concurrency) -> Self {
        match value {
            Concurrency::Allow => Self::AllowConcurrent,
            Concurrency::Forbid => Self::ForbidConcurrent,
        }
    }
}

impl From<ConcurrencyPolicy> for Concurrency {
    fn from(value: ConcurrencyPolicy) -> Self {
        match value {
            ConcurrencyPolicy::AllowConcurrent => Self::Allow,
            ConcurrencyPolicy::ForbidConcurrent => Self::Forbid,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum Misfire {
    FireNow,
    Ignore,
    Skip,
}

impl From<Misfire> for MisfirePolicy {
    fn from(value: Misfire) -> Self {
        match value {
            Misfire::FireNow => Self::FireNow,
            Misfire::Ignore => Self::Ignore,
            Misfire::Skip => Self::Skip,
        }
    }
}

impl From<MisfirePolicy> for Misfire {
    fn from(value: MisfirePolicy) -> Self {
        match value {
            MisfirePolicy::FireNow => Self::FireNow,
            MisfirePolicy::Ignore => Self::Ignore,
            MisfirePolicy::Skip => Self::Skip,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
pub(crate) enum Outcome {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl From<Outcome> for ExecutionOutcome {
    fn from(value: Outcome) -> Self {
        match value {
            Outcome::Running => Self::Running,
            Outcome::Succeeded => Self::Succeeded,
            Outcome::Failed => Self::Failed,
            Outcome::Skipped => Self::Skipped,
        }
    }
}

impl From<ExecutionOutcome> for Outcome {
    fn from(value: ExecutionOutcome) -> Self {
        match value {
            ExecutionOutcome::Running => Self::Running,
            ExecutionOutcome::Succeeded => Self::Succeeded,
            ExecutionOutcome::Failed => Self::Failed,
            ExecutionOutcome::Skipped => Self::Skipped,
        }
    }
}

/// Timestamps are stored as milliseconds since the unix epoch.
pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>, BackendError> {
    DateTime::from_timestamp_millis(millis).ok_or(BackendError::BadState)
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub name: String,
    pub job_group: String,
    pub schedule: String,
    pub target: String,
    pub status: Status,
    pub concurrency_policy: Concurrency,
    pub misfire_policy: Misfire,
    pub retry: Option<String>,
    pub next_fire_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = BackendError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            name: value.name,
            group: value.job_group,
            schedule: value.schedule,
            target: serde_json::from_str(&value.target)?,
            status: value.status.into(),
            concurrency_policy: value.concurrency_policy.into(),
            misfire_policy: value.misfire_policy.into(),
            retry: value
                .retry
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            next_fire_at: value.next_fire_at.map(from_millis).transpose()?,
            created_at: from_millis(value.created_at)?,
            updated_at: from_millis(value.updated_at)?,
        })
    }
}

impl TryFrom<&Job> for JobRow {
    type Error = BackendError;

    fn try_from(value: &Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.as_str().to_owned(),
            name: value.name.clone(),
            job_group: value.group.clone(),
            schedule: value.schedule.clone(),
            target: serde_json::to_string(&value.target)?,
            status: value.status.into(),
            concurrency_policy: value.concurrency_policy.into(),
            misfire_policy: value.misfire_policy.into(),
            retry: value.retry.as_ref().map(serde_json::to_string).transpose()?,
            next_fire_at: value.next_fire_at.map(|at| at.timestamp_millis()),
            created_at: value.created_at.timestamp_millis(),
            updated_at: value.updated_at.timestamp_millis(),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ExecutionRow {
    pub id: i64,
    pub job_id: String,
    pub fired_at: i64,
    pub completed_at: Option<i64>,
    pub outcome: Outcome,
    pub error_detail: Option<String>,
    pub attempts: i64,
}

impl TryFrom<ExecutionRow> for ExecutionRecord {
    type Error = BackendError;

    fn try_from(value: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            job_id: value.job_id.into(),
            fired_at: from_millis(value.fired_at)?,
            completed_at: value.completed_at.map(from_millis).transpose()?,
            outcome: value.outcome.into(),
            error_detail: value.error_detail,
            attempts: u16::try_from(value.attempts).map_err(|_| BackendError::BadState)?,
        })
    }
}
