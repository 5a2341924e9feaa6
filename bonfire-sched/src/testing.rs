//! Helpers for testing code built on the scheduler.
use std::time::Duration;

use crate::{
    backend::ExecutionLog,
    execution::{ExecutionOutcome, ExecutionRecord},
    job::{query::Page, JobId},
};

/// A macro for making assertions about the execution history of a job.
///
/// Counts can be asserted for the total number of records and for each outcome: `running`,
/// `succeeded`, `failed` and `skipped`.
///
/// # Example
///
/// ```
/// # use bonfire_sched::prelude::*;
/// # use bonfire_sched::execution::Completion;
/// # use bonfire_sched::testing::assert_executions;
/// # use chrono::Utc;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use bonfire_sched::backend::{memory::InMemoryBackend, ExecutionLog};
/// let backend = InMemoryBackend::new();
/// let job_id = JobId::from("job");
///
/// let record = backend
///     .open(&job_id, Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
///     .await
///     .unwrap();
/// backend
///     .open(&job_id, Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
///     .await
///     .unwrap();
/// backend.finalize(record.id, Completion::Succeeded, 1).await.unwrap();
///
/// assert_executions!(
///     2 executions,
///     in: backend,
///     for_job: &job_id,
///     succeeded: 1,
///     skipped: 1,
/// );
/// assert_executions!(in: backend, for_job: &job_id, failed: 0);
/// # });
/// ```
#[macro_export]
macro_rules! assert_executions {
    ($n:literal executions, in: $log:expr, for_job: $job_id:expr $(, $($tail:tt)*)?) => {{
        let records = $crate::testing::all_executions(&$log, $job_id).await;
        assert!(
            records.len() == $n,
            "Unexpected number of executions,\n\n\
            Expected {} executions, found {}:\n\n\
            {records:#?}",
            $n,
            records.len(),
        );
        $($crate::assert_executions!(@outcome records; $($tail)*);)?
    }};
    (in: $log:expr, for_job: $job_id:expr, $($tail:tt)*) => {{
        let records = $crate::testing::all_executions(&$log, $job_id).await;
        $crate::assert_executions!(@outcome records; $($tail)*);
    }};
    (@outcome $records:ident;) => {};
    (@outcome $records:ident; $outcome:ident: $n:expr $(, $($tail:tt)*)?) => {
        let outcome = $crate::assert_executions!(@outcome_of $outcome);
        let found = $records
            .iter()
            .filter(|record| record.outcome == outcome)
            .count();
        assert!(
            found == $n,
            "Expected {} {} executions, found {found}:\n\n{:#?}",
            $n,
            stringify!($outcome),
            $records,
        );
        $($crate::assert_executions!(@outcome $records; $($tail)*);)?
    };
    (@outcome_of running) => {
        $crate::execution::ExecutionOutcome::Running
    };
    (@outcome_of succeeded) => {
        $crate::execution::ExecutionOutcome::Succeeded
    };
    (@outcome_of failed) => {
        $crate::execution::ExecutionOutcome::Failed
    };
    (@outcome_of skipped) => {
        $crate::execution::ExecutionOutcome::Skipped
    };
}

pub use assert_executions;

const PAGE_SIZE: u32 = 100;

/// Every execution record of a job, most recent fire first.
pub async fn all_executions<L>(log: &L, job_id: &JobId) -> Vec<ExecutionRecord>
where
    L: ExecutionLog + ?Sized,
{
    let mut records = Vec::new();
    for number in 1.. {
        let page = log
            .list(job_id, Page::new(number, PAGE_SIZE))
            .await
            .expect("Failed to list executions");
        let done = page.items.len() < PAGE_SIZE as usize;
        records.extend(page.items);
        if done {
            break;
        }
    }
    records
}

/// Poll the execution history of a job until `predicate` holds, returning the records it held
/// for.
///
/// # Panics
///
/// When `predicate` does not hold within `timeout`.
pub async fn wait_for_executions<L, F>(
    log: &L,
    job_id: &JobId,
    timeout: Duration,
    predicate: F,
) -> Vec<ExecutionRecord>
where
    L: ExecutionLog + ?Sized,
    F: Fn(&[ExecutionRecord]) -> bool,
{
    let poll = async {
        loop {
            let records = all_executions(log, job_id).await;
            if predicate(&records) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(records) => records,
        Err(_) => {
            let records = all_executions(log, job_id).await;
            panic!("Executions of {job_id} did not match within {timeout:?}:\n\n{records:#?}")
        }
    }
}

/// Count the records with the given outcome.
pub fn count_outcome(records: &[ExecutionRecord], outcome: ExecutionOutcome) -> usize {
    records
        .iter()
        .filter(|record| record.outcome == outcome)
        .count()
}
