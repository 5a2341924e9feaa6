//! The job data model.
//!
//! A [`Job`] is a named, cron driven unit of work. The declarative part of a job, the part a
//! caller may create and update, is described by a [`JobDefinition`]. Everything else on a
//! [`Job`] is managed by the store and the trigger engine.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod builder;
pub mod query;
pub mod retry;
pub mod schedule;

pub use builder::{InvalidDefinition, JobDefinition};

use retry::RetryPolicy;

/// Opaque identifier of a job, assigned by the store on creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh, random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Whether the trigger engine holds a live timer for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 2] = [JobStatus::Active, JobStatus::Paused];
}

/// Whether overlapping fires of the same job may run at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    #[default]
    AllowConcurrent,
    /// A fire arriving while a previous fire of the job is still running is recorded as
    /// skipped and never queued.
    ForbidConcurrent,
}

impl ConcurrencyPolicy {
    pub(crate) fn is_single_flight(self) -> bool {
        matches!(self, Self::ForbidConcurrent)
    }
}

/// What to do with fire times that elapsed without the job running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// Execute once immediately, then continue with the next future occurrence.
    #[default]
    FireNow,
    /// Fire every missed occurrence in order, bounded by
    /// [`crate::SchedulerConfig::with_max_catch_up`].
    Ignore,
    /// Drop the missed occurrences and continue with the next future occurrence.
    Skip,
}

/// The executable logic a job refers to: the name of a registered [`crate::Executor`] and the
/// parameters it should be called with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationTarget {
    pub handler: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl InvocationTarget {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(self, params: serde_json::Value) -> Self {
        Self { params, ..self }
    }
}

/// A scheduled job as held by a [`crate::backend::JobStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub group: String,
    pub schedule: String,
    pub target: InvocationTarget,
    pub status: JobStatus,
    pub concurrency_policy: ConcurrencyPolicy,
    pub misfire_policy: MisfirePolicy,
    pub retry: Option<RetryPolicy>,
    /// The last fire time computed by the trigger engine.
    ///
    /// It is kept while the job is paused, so on resume or restart the engine can tell whether
    /// an occurrence was missed.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a job from a definition that has already been validated.
    pub fn from_definition(id: JobId, definition: JobDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: definition.name,
            group: definition.group,
            schedule: definition.schedule,
            target: definition.target,
            status: JobStatus::Active,
            concurrency_policy: definition.concurrency_policy,
            misfire_policy: definition.misfire_policy,
            retry: definition.retry,
            next_fire_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the mutable part of the job with the given definition.
    ///
    /// The status is left untouched; status changes only go through pause and resume. The
    /// stored next fire time is dropped when the schedule changes.
    pub fn apply(&mut self, definition: JobDefinition, now: DateTime<Utc>) {
        if self.schedule != definition.schedule {
            self.next_fire_at = None;
        }
        self.name = definition.name;
        self.group = definition.group;
        self.schedule = definition.schedule;
        self.target = definition.target;
        self.concurrency_policy = definition.concurrency_policy;
        self.misfire_policy = definition.misfire_policy;
        self.retry = definition.retry;
        self.updated_at = now;
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }
}

/// The result of changing a job's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    /// The job after the change.
    pub job: Job,
    pub previous: JobStatus,
}

impl StatusTransition {
    pub fn changed(&self) -> bool {
        self.previous != self.job.status
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    impl Job {
        pub(crate) fn raw_job() -> Self {
            Job::from_definition(
                JobId::generate(),
                JobDefinition::raw_definition(),
                Utc::now(),
            )
        }

        pub(crate) fn with_status(self, status: JobStatus) -> Self {
            Self { status, ..self }
        }
    }

    #[test]
    fn apply_keeps_status_and_clears_next_fire_on_schedule_change() {
        let mut job = Job::raw_job().with_status(JobStatus::Paused);
        job.next_fire_at = Some(Utc::now());

        job.apply(
            JobDefinition::raw_definition().with_name("renamed"),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.name, "renamed");
        assert!(job.next_fire_at.is_some());

        job.apply(
            JobDefinition::raw_definition().with_schedule("0 0 * * * *"),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.next_fire_at, None);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn job_id_display() {
        assert_eq!(JobId::from("abc").to_string(), "JobId(abc)");
    }
}
