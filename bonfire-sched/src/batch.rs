//! Batch pause, resume and delete.
//!
//! Every id in a batch is handled on its own: the outcome of each is reported individually and a
//! failing id never stops the remaining ones. Store mutations always commit before the trigger
//! engine is touched.
use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;

use crate::{
    backend::{BackendError, JobStore},
    job::{JobId, JobStatus},
    trigger::TriggerEngine,
    SchedulerError,
};

/// Why a single id of a batch failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("Job not found")]
    NotFound,
    #[error("Job is already scheduled")]
    SchedulingConflict,
    #[error("{0}")]
    Backend(String),
}

impl From<BackendError> for ItemError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::JobNotFound(_) => Self::NotFound,
            err => Self::Backend(err.to_string()),
        }
    }
}

impl From<SchedulerError> for ItemError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::Backend(err) => err.into(),
            SchedulerError::SchedulingConflict(_) => Self::SchedulingConflict,
            err => Self::Backend(err.to_string()),
        }
    }
}

/// The outcome of every distinct id of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub results: BTreeMap<JobId, Result<(), ItemError>>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.results.values().all(Result::is_ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&JobId, &ItemError)> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|err| (id, err)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Pause,
    Resume,
    Delete,
}

/// Applies pause, resume and delete to jobs, keeping the store and the trigger engine in step.
#[derive(Clone)]
pub struct BatchOperationCoordinator {
    store: Arc<dyn JobStore>,
    engine: Arc<TriggerEngine>,
}

impl BatchOperationCoordinator {
    pub(crate) fn new(store: Arc<dyn JobStore>, engine: Arc<TriggerEngine>) -> Self {
        Self { store, engine }
    }

    pub async fn pause_many(&self, ids: &[JobId]) -> Result<BatchReport, SchedulerError> {
        self.apply(Operation::Pause, ids).await
    }

    pub async fn resume_many(&self, ids: &[JobId]) -> Result<BatchReport, SchedulerError> {
        self.apply(Operation::Resume, ids).await
    }

    /// Delete jobs. Their execution history is kept.
    pub async fn delete_many(&self, ids: &[JobId]) -> Result<BatchReport, SchedulerError> {
        self.apply(Operation::Delete, ids).await
    }

    async fn apply(
        &self,
        operation: Operation,
        ids: &[JobId],
    ) -> Result<BatchReport, SchedulerError> {
        if ids.is_empty() {
            return Err(SchedulerError::EmptyRequest);
        }
        let mut report = BatchReport::default();
        for id in ids {
            if report.results.contains_key(id) {
                continue;
            }
            let result = match operation {
                Operation::Pause => self.pause(id).await,
                Operation::Resume => self.resume(id).await,
                Operation::Delete => self.delete(id).await,
            };
            if let Err(err) = &result {
                tracing::warn!(
                    job_id = %id,
                    ?operation,
                    ?err,
                    "Failed to {operation:?} job {id}: {err}"
                );
            }
            report.results.insert(id.clone(), result);
        }
        tracing::info!(
            ?operation,
            count = report.results.len(),
            failed = report.failures().count(),
            "Applied {operation:?} to {} jobs",
            report.results.len()
        );
        Ok(report)
    }

    /// Pause a job. Pausing a paused job is a successful no-op.
    pub async fn pause(&self, id: &JobId) -> Result<(), ItemError> {
        let transition = self.store.set_status(id, JobStatus::Paused).await?;
        // Unregistered even when already paused, in case a stale timer survived.
        self.engine.unregister(id).await;
        if transition.changed() {
            tracing::info!(job_id = %id, "Paused job {id}");
        }
        Ok(())
    }

    /// Resume a job, applying its misfire policy to the fires missed while paused. Resuming an
    /// active job is a successful no-op.
    pub async fn resume(&self, id: &JobId) -> Result<(), ItemError> {
        let transition = self.store.set_status(id, JobStatus::Active).await?;
        if !transition.changed() && self.engine.is_registered(id).await {
            return Ok(());
        }
        self.engine.register(id).await?;
        tracing::info!(job_id = %id, "Resumed job {id}");
        Ok(())
    }

    pub async fn delete(&self, id: &JobId) -> Result<(), ItemError> {
        Ok(self.remove(id).await?)
    }

    /// Stop the job's timer, then delete the job. Its execution history is kept.
    pub(crate) async fn remove(&self, id: &JobId) -> Result<(), BackendError> {
        self.engine.unregister(id).await;
        self.store.delete(id).await?;
        tracing::info!(job_id = %id, "Deleted job {id}");
        Ok(())
    }
}
