//! Provides an in memory implementation of [`JobStore`] and [`ExecutionLog`].
//!
//! Nothing survives a restart, so this is meant for tests and for embedding the scheduler where
//! durability is not needed.
//!
//! It is not optimized instead is designed to be a correct implementation for use in a test setup.
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    execution::{Completion, ExecutionId, ExecutionRecord},
    job::{
        query::{JobFilter, Page, Paged},
        ConcurrencyPolicy, Job, JobDefinition, JobId, JobStatus, StatusTransition,
    },
    pruner::{PruneBy, PruneSpec},
};

use super::{queryable::Queryable, BackendError, ExecutionLog, JobStore};

/// An in memory implementation of [`JobStore`] and [`ExecutionLog`].
///
/// Clones share the same underlying state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    executions: Arc<RwLock<Vec<ExecutionRecord>>>,
    id_counter: Arc<AtomicI64>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_unique_name(
        jobs: &[Job],
        definition: &JobDefinition,
        except: Option<&JobId>,
    ) -> Result<(), BackendError> {
        let duplicate = jobs.iter().any(|job| {
            Some(&job.id) != except && job.name == definition.name && job.group == definition.group
        });
        if duplicate {
            return Err(BackendError::DuplicateName {
                name: definition.name.clone(),
                group: definition.group.clone(),
            });
        }
        Ok(())
    }

    fn with_job<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Job) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|job| &job.id == id) {
            None => Err(BackendError::JobNotFound(id.clone())),
            Some(job) => f(job),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryBackend {
    async fn create(&self, definition: JobDefinition) -> Result<JobId, BackendError> {
        definition.validate()?;
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        Self::ensure_unique_name(&jobs, &definition, None)?;
        let id = JobId::generate();
        jobs.push(Job::from_definition(id.clone(), definition, Utc::now()));
        Ok(id)
    }

    async fn update(&self, id: &JobId, definition: JobDefinition) -> Result<Job, BackendError> {
        definition.validate()?;
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        if !jobs.iter().any(|job| &job.id == id) {
            return Err(BackendError::JobNotFound(id.clone()));
        }
        Self::ensure_unique_name(&jobs, &definition, Some(id))?;
        let job = jobs
            .iter_mut()
            .find(|job| &job.id == id)
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        job.apply(definition, Utc::now());
        Ok(job.clone())
    }

    async fn get(&self, id: &JobId) -> Result<Job, BackendError> {
        self.jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| &job.id == id)
            .cloned()
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> Result<Paged<Job>, BackendError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(page.slice(jobs))
    }

    async fn delete(&self, id: &JobId) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| &job.id != id);
        if jobs.len() == before {
            return Err(BackendError::JobNotFound(id.clone()));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        id: &JobId,
        status: JobStatus,
    ) -> Result<StatusTransition, BackendError> {
        self.with_job(id, |job| {
            let previous = job.status;
            if previous != status {
                job.status = status;
                job.updated_at = Utc::now();
            }
            Ok(StatusTransition {
                job: job.clone(),
                previous,
            })
        })
    }

    async fn set_next_fire_at(
        &self,
        id: &JobId,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        self.with_job(id, |job| {
            job.next_fire_at = next_fire_at;
            Ok(())
        })
    }

    async fn active_jobs(&self) -> Result<Vec<Job>, BackendError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| job.is_active())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionLog for InMemoryBackend {
    async fn open(
        &self,
        job_id: &JobId,
        fired_at: DateTime<Utc>,
        concurrency_policy: ConcurrencyPolicy,
    ) -> Result<ExecutionRecord, BackendError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| BackendError::BadState)?;
        let already_running = concurrency_policy.is_single_flight()
            && executions
                .iter()
                .any(|record| &record.job_id == job_id && record.is_running());
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let record = ExecutionRecord::open(
            id.into(),
            job_id.clone(),
            fired_at,
            already_running,
            Utc::now(),
        );
        executions.push(record.clone());
        Ok(record)
    }

    async fn finalize(
        &self,
        id: ExecutionId,
        completion: Completion,
        attempts: u16,
    ) -> Result<ExecutionRecord, BackendError> {
        let mut executions = self
            .executions
            .write()
            .map_err(|_| BackendError::BadState)?;
        match executions.iter_mut().find(|record| record.id == id) {
            None => Err(BackendError::ExecutionNotFound(id)),
            Some(record) if !record.is_running() => Err(BackendError::AlreadyFinalized {
                id,
                outcome: record.outcome,
            }),
            Some(record) => {
                record.complete(completion, attempts, Utc::now());
                Ok(record.clone())
            }
        }
    }

    async fn list(
        &self,
        job_id: &JobId,
        page: Page,
    ) -> Result<Paged<ExecutionRecord>, BackendError> {
        let mut records: Vec<_> = self
            .executions
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|record| &record.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.fired_at.cmp(&a.fired_at).then(b.id.cmp(&a.id)));
        Ok(page.slice(records))
    }

    async fn abandon_running(&self, detail: &str) -> Result<u64, BackendError> {
        let now = Utc::now();
        let mut count = 0;
        self.executions
            .write()
            .map_err(|_| BackendError::BadState)?
            .iter_mut()
            .filter(|record| record.is_running())
            .for_each(|record| {
                let attempts = record.attempts;
                record.complete(Completion::failed(detail), attempts, now);
                count += 1;
            });
        Ok(count)
    }

    async fn prune(&self, spec: &PruneSpec) -> Result<u64, BackendError> {
        let now = Utc::now();
        let mut executions = self
            .executions
            .write()
            .map_err(|_| BackendError::BadState)?;
        let before = executions.len();
        match spec.prune_by {
            PruneBy::MaxAge(age) => {
                let cutoff = now - age;
                executions.retain(|record| !(spec.matches(record) && record.fired_at < cutoff));
            }
            PruneBy::MaxLength(length) => {
                // Newest first, so the records beyond `length` per job are the oldest ones.
                executions.sort_by(|a, b| b.fired_at.cmp(&a.fired_at).then(b.id.cmp(&a.id)));
                let mut seen = std::collections::HashMap::<JobId, u32>::new();
                executions.retain(|record| {
                    if !spec.matches(record) {
                        return true;
                    }
                    let count = seen.entry(record.job_id.clone()).or_default();
                    *count += 1;
                    *count <= length
                });
            }
        }
        Ok((before - executions.len()) as u64)
    }
}
