//! A cron driven job scheduler with a durable execution history.
//!
//! Jobs are stored through a [`backend::JobStore`], every fire is recorded in a
//! [`backend::ExecutionLog`] and the work itself is done by [`Executor`]s registered on the
//! [`Scheduler`].
//!
//! # Example
//!
//! ```
//! # use bonfire_sched::prelude::*;
//! # use bonfire_sched::backend::memory::InMemoryBackend;
//! # use async_trait::async_trait;
//! pub struct ReportExecutor;
//!
//! #[async_trait]
//! impl Executor for ReportExecutor {
//!     type Params = String;
//!     const NAME: &'static str = "report";
//!
//!     async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult {
//!         println!("Writing {} report", invocation.params);
//!         ExecutionResult::Done
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let handle = Scheduler::from_backend(InMemoryBackend::new())
//!     .with_executor::<ReportExecutor>()
//!     .start()
//!     .await
//!     .unwrap();
//!
//! let id = handle
//!     .create_job(
//!         JobDefinition::new("nightly", "0 0 2 * * *", ReportExecutor::NAME)
//!             .with_params(serde_json::json!("sales")),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(handle.get_job(&id).await.unwrap().status, JobStatus::Active);
//!
//! handle.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod batch;
pub mod config;
pub mod execution;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod pruner;
pub mod testing;
pub mod trigger;

pub use config::SchedulerConfig;
pub use executor::Executor;

use backend::{BackendError, ExecutionLog, JobStore};
use batch::{BatchOperationCoordinator, BatchReport};
use execution::{coordinator::ExecutionCoordinator, ExecutionRecord};
use executor::ExecutorRegistry;
use job::{
    query::{JobFilter, Page, Paged},
    InvalidDefinition, Job, JobDefinition, JobId,
};
use pruner::{runner::PrunerRunner, PrunerConfig};
use trigger::{Reconciled, TriggerEngine};

const INTERRUPTED: &str = "interrupted by scheduler restart";

/// Builds and starts a scheduler.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    log: Arc<dyn ExecutionLog>,
    config: SchedulerConfig,
    executors: ExecutorRegistry,
    pruners: Vec<PrunerConfig>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, log: Arc<dyn ExecutionLog>) -> Self {
        Self {
            store,
            log,
            config: Default::default(),
            executors: Default::default(),
            pruners: Vec::new(),
        }
    }

    /// Use a single backend as both the job store and the execution log.
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: JobStore + ExecutionLog + Clone + 'static,
    {
        Self::new(Arc::new(backend.clone()), Arc::new(backend))
    }

    pub fn with_config(self, config: SchedulerConfig) -> Self {
        Self { config, ..self }
    }

    /// Register an executor for jobs whose handler is [`Executor::NAME`].
    pub fn with_executor<E>(mut self) -> Self
    where
        E: Executor + 'static + Sync + Send,
    {
        self.executors.register::<E>();
        self
    }

    /// Periodically remove execution records according to the given config.
    pub fn with_pruner(mut self, config: PrunerConfig) -> Self {
        self.pruners.push(config);
        self
    }

    /// Start the scheduler.
    ///
    /// Executions left running by a previous process are failed, then every active job gets a
    /// timer. A job whose stored next fire time passed while the scheduler was down is resolved
    /// with its misfire policy.
    pub async fn start(self) -> Result<SchedulerHandle, SchedulerError> {
        let Self {
            store,
            log,
            config,
            executors,
            pruners,
        } = self;

        let abandoned = log.abandon_running(INTERRUPTED).await.inspect_err(|err| {
            tracing::error!(?err, "Failed to abandon running executions: {err}")
        })?;
        if abandoned > 0 {
            tracing::warn!(abandoned, "Failed {abandoned} executions left running");
        }

        let coordinator =
            ExecutionCoordinator::new(log.clone(), executors, config.max_concurrency());
        tracing::debug!(
            handlers = ?coordinator.handlers().collect::<Vec<_>>(),
            max_concurrency = config.max_concurrency(),
            "Starting scheduler"
        );
        let engine = Arc::new(TriggerEngine::new(
            store.clone(),
            coordinator.clone(),
            config,
        ));
        let batch = BatchOperationCoordinator::new(store.clone(), engine.clone());
        let cancellation_token = CancellationToken::new();

        engine.recover().await?;

        let reconciler = config.reconcile_interval().map(|interval| {
            engine
                .clone()
                .spawn_reconciler(interval, cancellation_token.child_token())
        });
        for pruner in pruners {
            PrunerRunner::new(log.clone(), pruner).spawn(cancellation_token.child_token());
        }

        Ok(SchedulerHandle {
            store,
            log,
            engine,
            coordinator,
            batch,
            cancellation_token,
            reconciler,
        })
    }
}

/// The running scheduler and its operations.
///
/// Dropping the handle stops every timer and background task without waiting for them.
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    log: Arc<dyn ExecutionLog>,
    engine: Arc<TriggerEngine>,
    coordinator: ExecutionCoordinator,
    batch: BatchOperationCoordinator,
    cancellation_token: CancellationToken,
    reconciler: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Page,
    ) -> Result<Paged<Job>, SchedulerError> {
        Ok(self.store.list(filter, page).await?)
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job, SchedulerError> {
        Ok(self.store.get(id).await?)
    }

    /// Create a job and start its timer.
    ///
    /// The job is stored before the timer is registered. If registering fails the job still
    /// exists and is picked up by the next reconciliation.
    pub async fn create_job(&self, definition: JobDefinition) -> Result<JobId, SchedulerError> {
        definition.validate()?;
        let id = self.store.create(definition).await?;
        tracing::info!(job_id = %id, "Created job {id}");
        self.engine.register(&id).await.inspect_err(|err| {
            tracing::error!(?err, job_id = %id, "Failed to register timer for job {id}: {err}")
        })?;
        Ok(id)
    }

    /// Replace the definition of a job, keeping its status.
    ///
    /// An active job's timer is replaced so that the new schedule takes effect immediately. The
    /// old timer is stopped before the store is written, so it can not store a fire time of the
    /// old schedule over the new one.
    pub async fn update_job(
        &self,
        id: &JobId,
        definition: JobDefinition,
    ) -> Result<Job, SchedulerError> {
        definition.validate()?;
        self.engine.unregister(id).await;
        let updated = self.store.update(id, definition).await;
        if let Ok(job) = &updated {
            tracing::info!(job_id = %id, "Updated job {id} to schedule {}", job.schedule);
        }
        // Restores the previous timer when the update failed.
        self.engine.register(id).await?;
        Ok(updated?)
    }

    pub async fn pause_jobs(&self, ids: &[JobId]) -> Result<BatchReport, SchedulerError> {
        self.batch.pause_many(ids).await
    }

    pub async fn resume_jobs(&self, ids: &[JobId]) -> Result<BatchReport, SchedulerError> {
        self.batch.resume_many(ids).await
    }

    /// Delete jobs. Their execution history is kept.
    pub async fn delete_jobs(&self, ids: &[JobId]) -> Result<BatchReport, SchedulerError> {
        self.batch.delete_many(ids).await
    }

    pub async fn delete_job(&self, id: &JobId) -> Result<(), SchedulerError> {
        Ok(self.batch.remove(id).await?)
    }

    /// Fire a job immediately, outside of its schedule.
    ///
    /// Paused jobs can be run too. The fire is subject to the job's concurrency policy, so the
    /// returned record is either running or skipped.
    pub async fn run_job(&self, id: &JobId) -> Result<ExecutionRecord, SchedulerError> {
        let job = self.store.get(id).await?;
        let receipt = self.coordinator.fire(&job, Utc::now()).await?;
        Ok(receipt.record)
    }

    /// The execution history of a job, most recent fire first.
    pub async fn list_execution_logs(
        &self,
        job_id: &JobId,
        page: Page,
    ) -> Result<Paged<ExecutionRecord>, SchedulerError> {
        Ok(self.log.list(job_id, page).await?)
    }

    /// Align the live timers with the active jobs in the store.
    pub async fn reconcile(&self) -> Result<Reconciled, SchedulerError> {
        self.engine.reconcile().await
    }

    /// Wait for every execution started so far to finish.
    pub async fn wait_idle(&self) {
        self.coordinator.wait_idle().await
    }

    /// Stop every timer and background task, then wait for the running executions to finish.
    pub async fn graceful_shutdown(mut self) -> Result<(), SchedulerError> {
        tracing::debug!("Shutting down scheduler");
        self.cancellation_token.cancel();
        self.engine.shutdown().await;
        if let Some(reconciler) = self.reconciler.take() {
            reconciler
                .await
                .map_err(|_| SchedulerError::GracefulShutdownFailed)?;
        }
        self.coordinator.shutdown().await;
        Ok(())
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
        self.engine.cancel();
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Job {0} already has a live timer")]
    SchedulingConflict(JobId),
    #[error(transparent)]
    InvalidDefinition(#[from] InvalidDefinition),
    #[error("The request contained no job ids")]
    EmptyRequest,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl SchedulerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Backend(BackendError::JobNotFound(_)))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::{DateTime, TimeDelta};

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        batch::ItemError,
        execution::{Completion, ExecutionOutcome},
        executor::test::{MockExecutionResult, MockReturnExecutor, SimpleExecutor},
        job::{schedule::Schedule, ConcurrencyPolicy, JobStatus, MisfirePolicy},
        testing::{count_outcome, wait_for_executions},
    };

    const FAR_FUTURE: &str = "0 0 0 1 1 *";

    async fn start(backend: &InMemoryBackend) -> SchedulerHandle {
        Scheduler::from_backend(backend.clone())
            .with_executor::<SimpleExecutor>()
            .with_executor::<MockReturnExecutor>()
            .start()
            .await
            .unwrap()
    }

    fn definition(schedule: &str) -> JobDefinition {
        JobDefinition::new(JobId::generate().as_str(), schedule, SimpleExecutor::NAME)
    }

    #[tokio::test]
    async fn setup() {
        let handle = start(&InMemoryBackend::new()).await;
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn create_job_registers_timer() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;

        let id = handle.create_job(definition(FAR_FUTURE)).await.unwrap();

        let job = handle.get_job(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert!(handle.engine.is_registered(&id).await);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn create_job_invalid_schedule() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;

        let result = handle.create_job(definition("every tuesday")).await;

        assert!(matches!(result, Err(SchedulerError::InvalidDefinition(_))));
        let jobs = handle
            .list_jobs(&JobFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(jobs.total, 0);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_job_keeps_paused_status() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let id = handle.create_job(definition(FAR_FUTURE)).await.unwrap();
        handle.pause_jobs(&[id.clone()]).await.unwrap();

        let job = handle
            .update_job(&id, definition("0 30 * * * *"))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.schedule, "0 30 * * * *");
        assert!(!handle.engine.is_registered(&id).await);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_job_replaces_stored_fire_time() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let id = handle.create_job(definition("* * * * * *")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.get_job(&id).await.unwrap().next_fire_at.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        handle.update_job(&id, definition(FAR_FUTURE)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let next = handle.get_job(&id).await.unwrap().next_fire_at.unwrap();
        assert!(Schedule::parse(FAR_FUTURE).unwrap().includes(&next));
        assert!(handle.engine.is_registered(&id).await);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn update_job_errors() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let id = handle.create_job(definition(FAR_FUTURE)).await.unwrap();

        let result = handle.update_job(&id, definition("not a schedule")).await;
        assert!(matches!(result, Err(SchedulerError::InvalidDefinition(_))));

        let result = handle
            .update_job(&JobId::from("nonexistent"), definition(FAR_FUTURE))
            .await;
        assert!(result.unwrap_err().is_not_found());
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn batch_operations_report_per_id() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let valid = handle.create_job(definition(FAR_FUTURE)).await.unwrap();
        let missing = JobId::from("nonexistent");

        let report = handle
            .pause_jobs(&[valid.clone(), missing.clone()])
            .await
            .unwrap();

        assert_eq!(report.results[&valid], Ok(()));
        assert_eq!(report.results[&missing], Err(ItemError::NotFound));
        assert_eq!(
            handle.get_job(&valid).await.unwrap().status,
            JobStatus::Paused
        );
        assert!(matches!(
            handle.resume_jobs(&[]).await,
            Err(SchedulerError::EmptyRequest)
        ));
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delete_job_keeps_history() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let id = handle.create_job(definition(FAR_FUTURE)).await.unwrap();
        handle.run_job(&id).await.unwrap();
        handle.wait_idle().await;

        handle.delete_job(&id).await.unwrap();

        assert!(handle.get_job(&id).await.unwrap_err().is_not_found());
        assert!(handle.delete_job(&id).await.unwrap_err().is_not_found());
        assert!(!handle.engine.is_registered(&id).await);
        let history = handle
            .list_execution_logs(&id, Page::default())
            .await
            .unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.items[0].outcome, ExecutionOutcome::Succeeded);
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn run_job_records_outcome() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let id = handle
            .create_job(
                definition(FAR_FUTURE)
                    .with_target(job::InvocationTarget::new(MockReturnExecutor::NAME))
                    .with_params(MockExecutionResult::Panic.params()),
            )
            .await
            .unwrap();

        let record = handle.run_job(&id).await.unwrap();
        assert_eq!(record.outcome, ExecutionOutcome::Running);
        handle.wait_idle().await;

        let history = handle
            .list_execution_logs(&id, Page::default())
            .await
            .unwrap();
        assert_eq!(history.items[0].outcome, ExecutionOutcome::Failed);
        assert!(history.items[0]
            .error_detail
            .as_deref()
            .is_some_and(|detail| detail.starts_with("panic")));
        assert!(handle
            .run_job(&JobId::from("nonexistent"))
            .await
            .unwrap_err()
            .is_not_found());
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_abandons_running_executions() {
        let backend = InMemoryBackend::new();
        let job_id = JobId::from("job");
        let running = backend
            .open(&job_id, Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
            .await
            .unwrap();
        let finished = backend
            .open(
                &JobId::from("other"),
                Utc::now(),
                ConcurrencyPolicy::ForbidConcurrent,
            )
            .await
            .unwrap();
        backend
            .finalize(finished.id, Completion::Succeeded, 1)
            .await
            .unwrap();

        let handle = start(&backend).await;

        let records = handle
            .list_execution_logs(&job_id, Page::default())
            .await
            .unwrap();
        assert_eq!(records.items[0].id, running.id);
        assert_eq!(records.items[0].outcome, ExecutionOutcome::Failed);
        assert_eq!(records.items[0].error_detail.as_deref(), Some(INTERRUPTED));
        let records = handle
            .list_execution_logs(&JobId::from("other"), Page::default())
            .await
            .unwrap();
        assert_eq!(records.items[0].outcome, ExecutionOutcome::Succeeded);
        handle.graceful_shutdown().await.unwrap();
    }

    /// An occurrence of `0 * * * * *` ten minutes in the past.
    fn every_minute_missed() -> DateTime<Utc> {
        Schedule::parse("0 * * * * *")
            .unwrap()
            .next_after(&(Utc::now() - TimeDelta::minutes(11)))
            .unwrap()
    }

    #[tokio::test]
    async fn restart_applies_skip_misfire_policy() {
        let backend = InMemoryBackend::new();
        let id = backend
            .create(definition("0 * * * * *").with_misfire_policy(MisfirePolicy::Skip))
            .await
            .unwrap();
        let missed = every_minute_missed();
        backend.set_next_fire_at(&id, Some(missed)).await.unwrap();

        let handle = start(&backend).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let records = handle
            .list_execution_logs(&id, Page::default())
            .await
            .unwrap();
        assert_eq!(records.total, 0);
        let next = handle.get_job(&id).await.unwrap().next_fire_at.unwrap();
        assert!(next > Utc::now());
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_applies_fire_now_misfire_policy() {
        let backend = InMemoryBackend::new();
        let id = backend
            .create(definition("0 * * * * *").with_misfire_policy(MisfirePolicy::FireNow))
            .await
            .unwrap();
        let missed = every_minute_missed();
        backend.set_next_fire_at(&id, Some(missed)).await.unwrap();

        let handle = start(&backend).await;

        let records = wait_for_executions(&backend, &id, Duration::from_secs(5), |records| {
            count_outcome(records, ExecutionOutcome::Succeeded) == 1
        })
        .await;
        assert_eq!(records.len(), 1);
        assert!(records[0].fired_at > missed + TimeDelta::minutes(9));
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn paused_jobs_stay_paused_across_restart() {
        let backend = InMemoryBackend::new();
        let handle = start(&backend).await;
        let active = handle.create_job(definition(FAR_FUTURE)).await.unwrap();
        let paused = handle.create_job(definition(FAR_FUTURE)).await.unwrap();
        handle.pause_jobs(&[paused.clone()]).await.unwrap();
        handle.graceful_shutdown().await.unwrap();

        let handle = start(&backend).await;

        assert_eq!(handle.engine.registered().await, vec![active]);
        assert_eq!(
            handle.get_job(&paused).await.unwrap().status,
            JobStatus::Paused
        );
        handle.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_interval_restores_timers() {
        let backend = InMemoryBackend::new();
        let handle = Scheduler::from_backend(backend.clone())
            .with_config(
                SchedulerConfig::new().with_reconcile_interval(Some(Duration::from_millis(50))),
            )
            .start()
            .await
            .unwrap();
        // Created behind the scheduler's back
        let id = backend.create(definition(FAR_FUTURE)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !handle.engine.is_registered(&id).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        handle.graceful_shutdown().await.unwrap();
    }
}
