//! The trigger engine: one live timer per active job.
//!
//! Every registered job gets its own timer task which sleeps until the job's next fire time,
//! resolves late wake ups with the job's [`crate::job::MisfirePolicy`] and hands fires to the
//! [`ExecutionCoordinator`]. The next fire time is written back to the [`JobStore`] so that it
//! survives pauses and restarts.
//!
//! Registration is serialized per job: every job id owns a slot guarded by an async mutex, so
//! registering and unregistering the same job never race while different jobs never wait on each
//! other.
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendError, JobStore},
    config::SchedulerConfig,
    execution::coordinator::ExecutionCoordinator,
    job::{schedule::Schedule, InvalidDefinition, Job, JobId},
    SchedulerError,
};

pub mod misfire;
mod runner;

use runner::TimerRunner;

struct Timer {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Timer {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn stop(self) {
        self.cancellation_token.cancel();
        let _ = self.handle.await.inspect_err(|err| {
            tracing::error!(?err, "Timer task failed with error: {err}");
        });
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<Timer>>>;

/// How [`TriggerEngine::reconcile`] changed the live timers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub registered: usize,
    pub unregistered: usize,
}

/// Owns the live timers of every active job.
pub struct TriggerEngine {
    store: Arc<dyn JobStore>,
    coordinator: ExecutionCoordinator,
    config: SchedulerConfig,
    slots: Mutex<HashMap<JobId, Slot>>,
    cancellation_token: CancellationToken,
}

impl TriggerEngine {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        coordinator: ExecutionCoordinator,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            config,
            slots: Default::default(),
            cancellation_token: CancellationToken::new(),
        }
    }

    fn slot(&self, id: &JobId) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, id: &JobId) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Drop the slot of `id` if nobody but the caller holds it.
    ///
    /// Must be called with the slot's timer already removed and the slot lock held.
    fn release_slot(&self, id: &JobId, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by the caller.
        if Arc::strong_count(slot) == 2 {
            slots.remove(id);
        }
    }

    /// Schedule the job with the given id, replacing its current timer if it has one.
    ///
    /// The job is read from the store while holding the job's slot, so the registered timer
    /// always reflects the latest stored definition. A job that is paused or no longer exists
    /// ends up without a timer. Returns whether a timer is live afterwards.
    pub async fn register(&self, id: &JobId) -> Result<bool, SchedulerError> {
        self.register_inner(id, false).await
    }

    /// Like [`TriggerEngine::register`], but fails with [`SchedulerError::SchedulingConflict`]
    /// if the job already has a live timer.
    pub async fn register_new(&self, id: &JobId) -> Result<bool, SchedulerError> {
        self.register_inner(id, true).await
    }

    async fn register_inner(&self, id: &JobId, conflict: bool) -> Result<bool, SchedulerError> {
        let slot = self.slot(id);
        let mut timer = slot.lock().await;
        if conflict && timer.as_ref().is_some_and(Timer::is_live) {
            tracing::error!(job_id = %id, "Job {id} already has a live timer");
            return Err(SchedulerError::SchedulingConflict(id.clone()));
        }
        if let Some(old) = timer.take() {
            old.stop().await;
        }

        let job = match self.store.get(id).await {
            Ok(job) if job.is_active() => job,
            Ok(_) | Err(BackendError::JobNotFound(_)) => {
                tracing::debug!(job_id = %id, "Job {id} is not active, no timer registered");
                self.release_slot(id, &slot);
                return Ok(false);
            }
            Err(err) => {
                self.release_slot(id, &slot);
                return Err(err.into());
            }
        };
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(err) => {
                self.release_slot(id, &slot);
                return Err(InvalidDefinition::from(err).into());
            }
        };

        *timer = Some(self.spawn(job, schedule));
        tracing::debug!(job_id = %id, "Registered timer for job {id}");
        Ok(true)
    }

    fn spawn(&self, job: Job, schedule: Schedule) -> Timer {
        let cancellation_token = self.cancellation_token.child_token();
        let runner = TimerRunner {
            job,
            schedule,
            store: self.store.clone(),
            coordinator: self.coordinator.clone(),
            misfire_threshold: self.config.misfire_threshold(),
            max_catch_up: self.config.max_catch_up(),
        };
        let handle = tokio::spawn(runner.run(cancellation_token.clone()));
        Timer {
            cancellation_token,
            handle,
        }
    }

    /// Cancel the live timer of the job, if it has one.
    ///
    /// Unregistering a job without a timer is a no-op. A running invocation of the job is never
    /// interrupted.
    pub async fn unregister(&self, id: &JobId) {
        let Some(slot) = self.existing_slot(id) else {
            return;
        };
        let mut timer = slot.lock().await;
        if let Some(old) = timer.take() {
            old.stop().await;
            tracing::debug!(job_id = %id, "Unregistered timer for job {id}");
        }
        self.release_slot(id, &slot);
    }

    pub async fn is_registered(&self, id: &JobId) -> bool {
        match self.existing_slot(id) {
            Some(slot) => slot.lock().await.as_ref().is_some_and(Timer::is_live),
            None => false,
        }
    }

    /// The ids of every job with a live timer.
    pub async fn registered(&self) -> Vec<JobId> {
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut registered = Vec::with_capacity(slots.len());
        for (id, slot) in slots {
            if slot.lock().await.as_ref().is_some_and(Timer::is_live) {
                registered.push(id);
            }
        }
        registered.sort();
        registered
    }

    /// Register every active job in the store, returning how many timers were started.
    ///
    /// Past fire times are resolved by each job's misfire policy when its timer starts.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let jobs = self.store.active_jobs().await?;
        tracing::info!(count = jobs.len(), "Recovering timers for active jobs");
        let mut recovered = 0;
        for job in jobs {
            match self.register_new(&job.id).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => tracing::error!(
                    ?err,
                    job_id = %job.id,
                    "Failed to recover timer for job {}: {err}",
                    job.id
                ),
            }
        }
        Ok(recovered)
    }

    /// Align the live timers with the store: drop timers of jobs that are no longer active and
    /// start timers for active jobs without one.
    pub async fn reconcile(&self) -> Result<Reconciled, SchedulerError> {
        let active: HashSet<JobId> = self
            .store
            .active_jobs()
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        let registered: HashSet<JobId> = self.registered().await.into_iter().collect();

        let mut reconciled = Reconciled::default();
        for id in registered.difference(&active) {
            // Re-registering checks the current status under the job's slot.
            if !self.register(id).await? {
                reconciled.unregistered += 1;
            }
        }
        for id in active.difference(&registered) {
            if self.register(id).await? {
                reconciled.registered += 1;
            }
        }
        if reconciled != Reconciled::default() {
            tracing::info!(?reconciled, "Reconciled job timers");
        }
        Ok(reconciled)
    }

    /// Periodically [`TriggerEngine::reconcile`] until cancelled.
    pub(crate) fn spawn_reconciler(
        self: Arc<Self>,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let _ = self.reconcile().await.inspect_err(|err| {
                            tracing::error!(?err, "Failed to reconcile job timers: {err}")
                        });
                    }
                }
            }
            tracing::debug!("Shutting down the timer reconciler");
        })
    }

    /// Cancel every timer without waiting for them to stop.
    pub(crate) fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    /// Stop every timer. Running invocations are left to the [`ExecutionCoordinator`].
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let slots: Vec<_> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, slot) in slots {
            if let Some(timer) = slot.lock().await.take() {
                timer.stop().await;
            }
        }
        tracing::debug!("Trigger engine stopped");
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeDelta, Utc};

    use crate::{
        backend::{memory::InMemoryBackend, ExecutionLog},
        execution::ExecutionOutcome,
        executor::{
            test::{MockExecutionResult, MockReturnExecutor, SimpleExecutor},
            Executor, ExecutorRegistry,
        },
        job::{
            query::Page, ConcurrencyPolicy, InvocationTarget, JobDefinition, JobStatus,
            MisfirePolicy,
        },
        testing::{count_outcome, wait_for_executions},
    };

    use super::*;

    const EVERY_SECOND: &str = "* * * * * *";

    fn engine(backend: &InMemoryBackend, config: SchedulerConfig) -> TriggerEngine {
        let mut executors = ExecutorRegistry::default();
        executors.register::<SimpleExecutor>();
        executors.register::<MockReturnExecutor>();
        let coordinator = ExecutionCoordinator::new(
            Arc::new(backend.clone()),
            executors,
            config.max_concurrency(),
        );
        TriggerEngine::new(Arc::new(backend.clone()), coordinator, config)
    }

    fn definition(schedule: &str) -> JobDefinition {
        JobDefinition::raw_definition()
            .with_schedule(schedule)
            .with_target(InvocationTarget::new(SimpleExecutor::NAME))
    }

    #[tokio::test]
    async fn register_fires_on_schedule() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition(EVERY_SECOND)).await.unwrap();

        assert!(engine.register(&id).await.unwrap());
        assert!(engine.is_registered(&id).await);
        assert_eq!(engine.registered().await, vec![id.clone()]);

        wait_for_executions(&backend, &id, Duration::from_secs(5), |records| {
            records
                .iter()
                .filter(|record| record.outcome == ExecutionOutcome::Succeeded)
                .count()
                >= 2
        })
        .await;
        assert!(backend.get(&id).await.unwrap().next_fire_at.is_some());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn register_paused_job_holds_no_timer() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition(EVERY_SECOND)).await.unwrap();
        backend.set_status(&id, JobStatus::Paused).await.unwrap();

        assert!(!engine.register(&id).await.unwrap());
        assert!(!engine.is_registered(&id).await);
        assert!(engine.registered().await.is_empty());
    }

    #[tokio::test]
    async fn register_missing_job_holds_no_timer() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = JobId::from("nonexistent");

        assert!(!engine.register(&id).await.unwrap());
        assert!(!engine.is_registered(&id).await);
    }

    #[tokio::test]
    async fn register_replaces_timer() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition(EVERY_SECOND)).await.unwrap();

        assert!(engine.register(&id).await.unwrap());
        assert!(engine.register(&id).await.unwrap());
        assert_eq!(engine.registered().await, vec![id.clone()]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn register_new_conflicts_with_live_timer() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition(EVERY_SECOND)).await.unwrap();

        assert!(engine.register_new(&id).await.unwrap());
        assert!(matches!(
            engine.register_new(&id).await,
            Err(SchedulerError::SchedulingConflict(conflict)) if conflict == id
        ));
        assert!(engine.is_registered(&id).await);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition(EVERY_SECOND)).await.unwrap();

        engine.register(&id).await.unwrap();
        engine.unregister(&id).await;
        assert!(!engine.is_registered(&id).await);
        engine.unregister(&id).await;
        engine.unregister(&JobId::from("nonexistent")).await;
        assert!(engine.registered().await.is_empty());
        assert!(engine.slots.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_preserves_next_fire_at() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition("0 0 0 1 1 *")).await.unwrap();

        engine.register(&id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.get(&id).await.unwrap().next_fire_at.is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        engine.unregister(&id).await;

        let next_fire_at = backend.get(&id).await.unwrap().next_fire_at.unwrap();
        assert!(next_fire_at > Utc::now());
    }

    async fn misfired(policy: MisfirePolicy, config: SchedulerConfig) -> usize {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, config);
        let id = backend
            .create(definition("0 * * * * *").with_misfire_policy(policy))
            .await
            .unwrap();
        // Missed the last ten minutes, as after a restart
        let missed = Schedule::parse("0 * * * * *")
            .unwrap()
            .next_after(&(Utc::now() - TimeDelta::minutes(11)));
        backend.set_next_fire_at(&id, missed).await.unwrap();

        engine.register(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.shutdown().await;
        engine.coordinator.wait_idle().await;

        let next_fire_at = backend.get(&id).await.unwrap().next_fire_at.unwrap();
        assert!(next_fire_at > Utc::now());
        assert!(next_fire_at <= Utc::now() + TimeDelta::minutes(1));
        ExecutionLog::list(&backend, &id, Page::default())
            .await
            .unwrap()
            .total as usize
    }

    #[tokio::test]
    async fn misfire_skip_produces_no_catch_up() {
        assert_eq!(
            misfired(MisfirePolicy::Skip, SchedulerConfig::default()).await,
            0
        );
    }

    #[tokio::test]
    async fn misfire_fire_now_fires_once() {
        assert_eq!(
            misfired(MisfirePolicy::FireNow, SchedulerConfig::default()).await,
            1
        );
    }

    #[tokio::test]
    async fn misfire_ignore_fires_missed_up_to_cap() {
        assert_eq!(
            misfired(
                MisfirePolicy::Ignore,
                SchedulerConfig::default().with_max_catch_up(3)
            )
            .await,
            3
        );
    }

    #[tokio::test]
    async fn recover_registers_active_jobs() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let active = backend.create(definition("0 0 0 1 1 *")).await.unwrap();
        let paused = backend.create(definition("0 0 0 1 1 *")).await.unwrap();
        backend.set_status(&paused, JobStatus::Paused).await.unwrap();

        assert_eq!(engine.recover().await.unwrap(), 1);
        assert_eq!(engine.registered().await, vec![active]);
        // Recovering twice conflicts for every live timer and starts nothing new
        assert_eq!(engine.recover().await.unwrap(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_aligns_with_store() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let stale = backend.create(definition("0 0 0 1 1 *")).await.unwrap();
        let missing = backend.create(definition("0 0 0 1 1 *")).await.unwrap();
        engine.register(&stale).await.unwrap();
        // Paused behind the engine's back
        backend.set_status(&stale, JobStatus::Paused).await.unwrap();

        let reconciled = engine.reconcile().await.unwrap();
        assert_eq!(
            reconciled,
            Reconciled {
                registered: 1,
                unregistered: 1
            }
        );
        assert_eq!(engine.registered().await, vec![missing]);
        assert_eq!(engine.reconcile().await.unwrap(), Reconciled::default());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn timer_stops_when_job_deleted() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition(EVERY_SECOND)).await.unwrap();
        engine.register(&id).await.unwrap();
        JobStore::delete(&backend, &id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.is_registered(&id).await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stored_fire_time_of_another_schedule_is_replaced() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        let id = backend.create(definition("0 0 0 1 1 *")).await.unwrap();
        // Left behind by a faster schedule the job no longer has
        let stale = Utc::now() + TimeDelta::milliseconds(1500);
        backend.set_next_fire_at(&id, Some(stale)).await.unwrap();

        engine.register(&id).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match backend.get(&id).await.unwrap().next_fire_at {
                    Some(next) if next != stale => return next,
                    _ => tokio::task::yield_now().await,
                }
            }
        })
        .await
        .unwrap();
        assert!(Schedule::parse("0 0 0 1 1 *").unwrap().includes(&next));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            ExecutionLog::list(&backend, &id, Page::default())
                .await
                .unwrap()
                .total,
            0
        );
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn forbid_concurrent_skips_fires_during_long_run() {
        let backend = InMemoryBackend::new();
        let engine = engine(&backend, SchedulerConfig::default());
        // Every second, each run taking one and a half
        let id = backend
            .create(
                definition(EVERY_SECOND)
                    .with_target(InvocationTarget::new(MockReturnExecutor::NAME))
                    .with_params(MockExecutionResult::SleepMillis { millis: 1500 }.params())
                    .with_concurrency_policy(ConcurrencyPolicy::ForbidConcurrent),
            )
            .await
            .unwrap();

        engine.register(&id).await.unwrap();
        let records = wait_for_executions(&backend, &id, Duration::from_secs(10), |records| {
            count_outcome(records, ExecutionOutcome::Succeeded) >= 2
                && count_outcome(records, ExecutionOutcome::Skipped) >= 2
        })
        .await;
        engine.shutdown().await;
        engine.coordinator.wait_idle().await;

        let runs: Vec<_> = records
            .iter()
            .filter(|record| record.outcome != ExecutionOutcome::Skipped)
            .collect();
        for skipped in records
            .iter()
            .filter(|record| record.outcome == ExecutionOutcome::Skipped)
        {
            assert_eq!(skipped.attempts, 0);
            assert!(runs.iter().any(|run| run.fired_at <= skipped.fired_at
                && run
                    .completed_at
                    .map_or(true, |completed_at| skipped.fired_at < completed_at)));
        }
    }
}
