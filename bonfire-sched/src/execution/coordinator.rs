//! Turns fires into execution records and handler invocations.
//!
//! Opening the record happens on the caller's path, so the outcome of the single flight check is
//! known as soon as [`ExecutionCoordinator::fire`] returns. The invocation itself runs on a
//! tracked task bounded by the worker pool, so a slow handler never delays the trigger that
//! fired it.
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};
use tokio_util::task::TaskTracker;
use tracing::{instrument, Instrument};

use crate::{
    backend::{BackendError, ExecutionLog},
    executor::{Dispatch, ExecutionFailure, ExecutorRegistry, Invocation},
    job::{retry::RetryPolicy, InvocationTarget, Job, JobId},
};

use super::{Completion, ExecutionOutcome, ExecutionRecord};

/// The result of firing a job.
#[derive(Debug)]
pub struct FireReceipt {
    /// The record as opened, either running or already skipped.
    pub record: ExecutionRecord,
    /// The invocation task, present when the record is running.
    pub handle: Option<JoinHandle<()>>,
}

impl FireReceipt {
    pub fn is_skipped(&self) -> bool {
        self.record.outcome == ExecutionOutcome::Skipped
    }
}

/// Executes fired jobs on a bounded pool of workers.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    log: Arc<dyn ExecutionLog>,
    executors: ExecutorRegistry,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Guards closing the tracker; `true` once shut down.
    closed: Arc<Mutex<bool>>,
}

/// The parts of a job an invocation needs, detached from the job itself.
struct Run {
    job_id: JobId,
    target: InvocationTarget,
    retry: Option<RetryPolicy>,
    record: ExecutionRecord,
}

impl ExecutionCoordinator {
    pub(crate) fn new(
        log: Arc<dyn ExecutionLog>,
        executors: ExecutorRegistry,
        max_concurrency: usize,
    ) -> Self {
        Self {
            log,
            executors,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tracker: TaskTracker::new(),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Record a fire of `job` and, unless it is skipped, start invoking its handler.
    ///
    /// The returned error is only ever a failure to open the record; handler failures end up in
    /// the record.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn fire(
        &self,
        job: &Job,
        fired_at: DateTime<Utc>,
    ) -> Result<FireReceipt, BackendError> {
        let record = self
            .log
            .open(&job.id, fired_at, job.concurrency_policy)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, job_id = %job.id, "Failed to open execution record: {err}")
            })?;

        if record.outcome == ExecutionOutcome::Skipped {
            tracing::warn!(
                job_id = %job.id,
                execution_id = %record.id,
                "Skipped fire of {} as a previous execution is still running",
                job.id,
            );
            return Ok(FireReceipt {
                record,
                handle: None,
            });
        }
        let run = Run {
            job_id: job.id.clone(),
            target: job.target.clone(),
            retry: job.retry,
            record: record.clone(),
        };
        let handle = self.tracker.spawn({
            let coordinator = self.clone();
            async move { coordinator.run(run).await }.in_current_span()
        });
        Ok(FireReceipt {
            record,
            handle: Some(handle),
        })
    }

    async fn run(self, run: Run) {
        let Run {
            job_id,
            target,
            retry,
            record,
        } = run;
        let Ok(_permit) = self.permits.acquire().await else {
            self.finalize(&job_id, &record, Completion::failed("worker pool closed"), 0)
                .await;
            return;
        };
        let Some(dispatcher) = self.executors.get(&target.handler) else {
            tracing::error!(
                %job_id,
                handler = %target.handler,
                "No executor registered for handler `{}`",
                target.handler
            );
            let detail = format!("no executor registered for handler `{}`", target.handler);
            self.finalize(&job_id, &record, Completion::failed(detail), 0)
                .await;
            return;
        };

        let mut attempts = 0;
        let completion = AssertUnwindSafe(Self::invoke(
            &job_id,
            &record,
            &target,
            retry,
            dispatcher.as_ref(),
            &mut attempts,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let failure = ExecutionFailure::panicked(panic, "invocation panicked".to_owned());
            Self::failed(&job_id, failure)
        });
        self.finalize(&job_id, &record, completion, attempts).await;
    }

    /// Invoke the handler until it succeeds or the retry policy gives up.
    async fn invoke(
        job_id: &JobId,
        record: &ExecutionRecord,
        target: &InvocationTarget,
        retry: Option<RetryPolicy>,
        dispatcher: &dyn Dispatch,
        attempt: &mut u16,
    ) -> Completion {
        loop {
            *attempt += 1;
            let attempt = *attempt;
            let invocation = Invocation {
                job_id: job_id.clone(),
                execution_id: record.id,
                fired_at: record.fired_at,
                attempt,
                params: target.params.clone(),
            };
            tracing::debug!(%job_id, attempt, "Executing job {job_id}");
            let failure = match dispatcher.dispatch(invocation).await {
                Ok(()) => break Completion::Succeeded,
                Err(failure) => failure,
            };
            match retry.filter(|policy| failure.transient && policy.should_retry(attempt)) {
                Some(policy) => {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        %job_id,
                        ?failure,
                        attempt,
                        "Job {job_id} failed and will be retried in {delay}: {failure}",
                    );
                    tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                }
                None => break Self::failed(job_id, failure),
            }
        }
    }

    fn failed(job_id: &JobId, failure: ExecutionFailure) -> Completion {
        tracing::error!(
            %job_id,
            ?failure,
            "Job {job_id} failed: error type: {}, message: {}",
            failure.error_type,
            failure.message
        );
        Completion::failed(failure.to_string())
    }

    async fn finalize(
        &self,
        job_id: &JobId,
        record: &ExecutionRecord,
        completion: Completion,
        attempts: u16,
    ) {
        if completion == Completion::Succeeded {
            tracing::debug!(%job_id, execution_id = %record.id, "Job {job_id} succeeded");
        }
        let _ = self
            .log
            .finalize(record.id, completion, attempts)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    execution_id = %record.id,
                    "Failed to finalize execution of job {job_id}, error: {err:?}",
                )
            });
    }

    /// Wait for every invocation started so far to finish.
    pub async fn wait_idle(&self) {
        let closed = self.closed.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        if !*closed {
            self.tracker.reopen();
        }
    }

    /// Stop accepting new invocations and wait for the running ones to finish.
    pub(crate) async fn shutdown(&self) {
        tracing::debug!(
            running = self.tracker.len(),
            "Waiting for running executions to finish"
        );
        *self.closed.lock().await = true;
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub(crate) fn handlers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.executors.handlers()
    }
}
