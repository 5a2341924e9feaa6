//! The storage contracts the scheduler depends on.
//!
//! [`JobStore`] owns job identity and every job mutation; [`ExecutionLog`] is the append only
//! history of fires. The two are independent: execution records only reference jobs, so a
//! store implementation must not cascade job deletion into the log.
//!
//! [`memory::InMemoryBackend`] implements both traits. Implementors of new backends can use the
//! [`crate::test_suite`] macro to check their implementation against the expected behaviour.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    execution::{Completion, ExecutionId, ExecutionOutcome, ExecutionRecord},
    job::{
        query::{JobFilter, Page, Paged},
        ConcurrencyPolicy, InvalidDefinition, Job, JobDefinition, JobId, JobStatus,
        StatusTransition,
    },
    pruner::PruneSpec,
};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

/// Durable record of job definitions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Validate and persist a new job in [`JobStatus::Active`].
    async fn create(&self, definition: JobDefinition) -> Result<JobId, BackendError>;
    /// Replace the definition of a job. The status is never changed by an update.
    async fn update(&self, id: &JobId, definition: JobDefinition) -> Result<Job, BackendError>;
    async fn get(&self, id: &JobId) -> Result<Job, BackendError>;
    /// List matching jobs, newest first.
    async fn list(&self, filter: &JobFilter, page: Page) -> Result<Paged<Job>, BackendError>;
    async fn delete(&self, id: &JobId) -> Result<(), BackendError>;
    /// Change the status of a job. Setting the current status again is not an error.
    async fn set_status(
        &self,
        id: &JobId,
        status: JobStatus,
    ) -> Result<StatusTransition, BackendError>;
    /// Record the next fire time computed by the trigger engine.
    async fn set_next_fire_at(
        &self,
        id: &JobId,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError>;
    async fn active_jobs(&self) -> Result<Vec<Job>, BackendError>;
}

/// Durable, append only history of fires.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Open a record for a fire of the given job.
    ///
    /// For [`ConcurrencyPolicy::ForbidConcurrent`] the check for a running record of the same
    /// job and the insert must be atomic: if a running record exists the new record is stored
    /// as [`ExecutionOutcome::Skipped`], already finalized.
    async fn open(
        &self,
        job_id: &JobId,
        fired_at: DateTime<Utc>,
        concurrency_policy: ConcurrencyPolicy,
    ) -> Result<ExecutionRecord, BackendError>;
    /// Finalize a running record. A record can only be finalized once.
    async fn finalize(
        &self,
        id: ExecutionId,
        completion: Completion,
        attempts: u16,
    ) -> Result<ExecutionRecord, BackendError>;
    /// List the records of a job, most recent fire first.
    async fn list(
        &self,
        job_id: &JobId,
        page: Page,
    ) -> Result<Paged<ExecutionRecord>, BackendError>;
    /// Fail every record still marked running, returning how many were affected.
    ///
    /// Used on start up: records left running by a previous process can never be finalized.
    async fn abandon_running(&self, detail: &str) -> Result<u64, BackendError>;
    /// Remove finalized records according to the given spec, returning how many were removed.
    async fn prune(&self, spec: &PruneSpec) -> Result<u64, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("A job named `{name}` already exists in group `{group}`")]
    DuplicateName { name: String, group: String },
    #[error(transparent)]
    InvalidDefinition(#[from] InvalidDefinition),
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),
    #[error("Execution {id} has already been finalized as {outcome:?}")]
    AlreadyFinalized {
        id: ExecutionId,
        outcome: ExecutionOutcome,
    },
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BackendError {
    pub fn storage(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(source))
    }
}
