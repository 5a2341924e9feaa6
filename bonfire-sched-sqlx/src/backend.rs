use async_trait::async_trait;
use bonfire_sched::{
    backend::{BackendError, ExecutionLog, JobStore},
    execution::{Completion, ExecutionId, ExecutionRecord},
    job::{
        query::{JobFilter, Page, Paged},
        ConcurrencyPolicy, Job, JobDefinition, JobId, JobStatus, StatusTransition,
    },
    pruner::PruneSpec,
};
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::{
    into_job, into_record, is_unique_violation, map_err,
    query::{self, ToQuery},
    types::{JobRow, Outcome, Status, JOB_COLUMNS},
    SqliteBackend,
};

/// Attempts at changing a status that keeps being changed concurrently.
const MAX_STATUS_SWAPS: usize = 8;

impl SqliteBackend {
    fn duplicate_or_storage(error: sqlx::Error, definition: &Job) -> BackendError {
        if is_unique_violation(&error) {
            return BackendError::DuplicateName {
                name: definition.name.clone(),
                group: definition.group.clone(),
            };
        }
        map_err(error)
    }
}

#[async_trait]
impl JobStore for SqliteBackend {
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    async fn create(&self, definition: JobDefinition) -> Result<JobId, BackendError> {
        definition.validate()?;
        let job = Job::from_definition(JobId::generate(), definition, Utc::now());
        let row = JobRow::try_from(&job)?;
        self.insert_job(&row)
            .await
            .map_err(|error| Self::duplicate_or_storage(error, &job))?;
        Ok(job.id)
    }

    #[instrument(skip(self, definition))]
    async fn update(&self, id: &JobId, definition: JobDefinition) -> Result<Job, BackendError> {
        definition.validate()?;
        // Only the definition columns of this job are written.
        let job = Job::from_definition(id.clone(), definition, Utc::now());
        let row = JobRow::try_from(&job)?;
        match self.update_definition(&row).await {
            Ok(Some(row)) => into_job(row),
            Ok(None) => Err(BackendError::JobNotFound(id.clone())),
            Err(error) => Err(Self::duplicate_or_storage(error, &job)),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Job, BackendError> {
        Self::select_job(&self.pool, id)
            .await
            .map_err(map_err)?
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))
            .and_then(into_job)
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> Result<Paged<Job>, BackendError> {
        let total: i64 = query::count_jobs(filter)
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
        let items = query::list_jobs(filter, page)
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(into_job)
            .collect::<Result<_, _>>()?;
        Ok(Paged {
            items,
            total: total as u64,
        })
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &JobId) -> Result<(), BackendError> {
        let result = sqlx::query("DELETE FROM bonfire_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected());
        Self::handle_update(result, id)
    }

    #[instrument(skip(self))]
    async fn set_status(
        &self,
        id: &JobId,
        status: JobStatus,
    ) -> Result<StatusTransition, BackendError> {
        let status = Status::from(status);
        for _ in 0..MAX_STATUS_SWAPS {
            let current = Self::select_job(&self.pool, id)
                .await
                .map_err(map_err)?
                .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
            let previous = current.status;
            let job = if previous == status {
                current
            } else {
                match self
                    .swap_status(id, previous, status, Utc::now().timestamp_millis())
                    .await
                    .map_err(map_err)?
                {
                    Some(job) => job,
                    // Changed by someone else since it was read.
                    None => continue,
                }
            };
            return Ok(StatusTransition {
                job: into_job(job)?,
                previous: previous.into(),
            });
        }
        Err(BackendError::BadState)
    }

    async fn set_next_fire_at(
        &self,
        id: &JobId,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE bonfire_jobs SET next_fire_at = ? WHERE id = ?")
            .bind(next_fire_at.map(|at| at.timestamp_millis()))
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected());
        Self::handle_update(result, id)
    }

    async fn active_jobs(&self) -> Result<Vec<Job>, BackendError> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM bonfire_jobs WHERE status = ? ORDER BY created_at"
        ))
        .bind(Status::Active)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(into_job)
        .collect()
    }
}

#[async_trait]
impl ExecutionLog for SqliteBackend {
    #[instrument(skip(self))]
    async fn open(
        &self,
        job_id: &JobId,
        fired_at: DateTime<Utc>,
        concurrency_policy: ConcurrencyPolicy,
    ) -> Result<ExecutionRecord, BackendError> {
        let single_flight = matches!(concurrency_policy, ConcurrencyPolicy::ForbidConcurrent);
        let row = self
            .insert_execution(
                job_id,
                fired_at.timestamp_millis(),
                single_flight,
                Utc::now().timestamp_millis(),
            )
            .await
            .map_err(map_err)?;
        into_record(row)
    }

    #[instrument(skip(self, completion))]
    async fn finalize(
        &self,
        id: ExecutionId,
        completion: Completion,
        attempts: u16,
    ) -> Result<ExecutionRecord, BackendError> {
        let outcome = Outcome::from(completion.outcome());
        let row = self
            .complete_execution(
                id,
                outcome,
                completion.into_error_detail(),
                attempts,
                Utc::now().timestamp_millis(),
            )
            .await
            .map_err(map_err)?;
        if let Some(row) = row {
            return into_record(row);
        }
        match self.execution_outcome(id).await.map_err(map_err)? {
            None => Err(BackendError::ExecutionNotFound(id)),
            Some(outcome) => Err(BackendError::AlreadyFinalized {
                id,
                outcome: outcome.into(),
            }),
        }
    }

    async fn list(
        &self,
        job_id: &JobId,
        page: Page,
    ) -> Result<Paged<ExecutionRecord>, BackendError> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bonfire_executions WHERE job_id = ?")
                .bind(job_id.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(map_err)?;
        let items = query::list_executions(job_id.as_str(), page)
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(into_record)
            .collect::<Result<_, _>>()?;
        Ok(Paged {
            items,
            total: total as u64,
        })
    }

    #[instrument(skip(self))]
    async fn abandon_running(&self, detail: &str) -> Result<u64, BackendError> {
        let result = sqlx::query(
            "UPDATE bonfire_executions SET outcome = ?, error_detail = ?, completed_at = ? \
            WHERE outcome = 'running'",
        )
        .bind(Outcome::Failed)
        .bind(detail)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn prune(&self, spec: &PruneSpec) -> Result<u64, BackendError> {
        if spec.outcomes.is_empty() {
            return Ok(0);
        }
        let result = spec
            .query()
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(result.rows_affected())
    }
}
