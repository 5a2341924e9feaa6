use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendError, JobStore},
    execution::coordinator::ExecutionCoordinator,
    job::{schedule::Schedule, Job},
};

use super::misfire::plan_fires;

/// The live timer of a single job.
pub(crate) struct TimerRunner {
    pub(crate) job: Job,
    pub(crate) schedule: Schedule,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) coordinator: ExecutionCoordinator,
    pub(crate) misfire_threshold: TimeDelta,
    pub(crate) max_catch_up: usize,
}

impl TimerRunner {
    pub(crate) async fn run(self, cancellation_token: CancellationToken) {
        let job_id = self.job.id.clone();
        // A stored fire time the schedule would not produce belongs to a replaced schedule.
        let stored = self
            .job
            .next_fire_at
            .filter(|due| self.schedule.includes(due));
        let mut due = match stored {
            Some(due) => due,
            None => match self.schedule.next_after(&Utc::now()) {
                Some(due) if self.persist(Some(due)).await => due,
                Some(_) => return,
                None => {
                    tracing::info!(%job_id, "Schedule of job {job_id} has no future fire time");
                    return;
                }
            },
        };

        loop {
            let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            let now = Utc::now();
            let plan = plan_fires(
                &self.schedule,
                due,
                now,
                self.job.misfire_policy,
                self.misfire_threshold,
                self.max_catch_up,
            );
            if plan.misfired {
                tracing::info!(
                    %job_id,
                    %due,
                    policy = ?self.job.misfire_policy,
                    fires = plan.fires.len(),
                    "Job {job_id} misfired",
                );
            }
            // Persisted before firing: a restart never replays these fires.
            if !self.persist(plan.next).await {
                break;
            }
            for fired_at in plan.fires {
                if cancellation_token.is_cancelled() {
                    break;
                }
                self.fire(fired_at).await;
            }
            match plan.next {
                Some(next) => due = next,
                None => {
                    tracing::info!(%job_id, "Schedule of job {job_id} has no future fire time");
                    break;
                }
            }
        }
        tracing::debug!(%job_id, "Timer for job {job_id} stopped");
    }

    async fn fire(&self, fired_at: DateTime<Utc>) {
        // Failures are logged by the coordinator, the timer keeps going regardless.
        let _ = self.coordinator.fire(&self.job, fired_at).await;
    }

    /// Store the next fire time, returning whether the timer should keep running.
    async fn persist(&self, next_fire_at: Option<DateTime<Utc>>) -> bool {
        let job_id = &self.job.id;
        match self.store.set_next_fire_at(job_id, next_fire_at).await {
            Ok(()) => true,
            Err(BackendError::JobNotFound(_)) => {
                tracing::debug!(%job_id, "Job {job_id} no longer exists, stopping its timer");
                false
            }
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to store next fire time of job {job_id}, error: {err:?}",
                );
                true
            }
        }
    }
}
