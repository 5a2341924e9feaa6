//! Test suite for ensuring a correct implementation of a backend.
use chrono::TimeDelta;

use crate::{
    execution::ExecutionOutcome,
    job::{retry::RetryPolicy, MisfirePolicy},
    pruner::PruneBy,
};

use super::*;

const HANDLER: &str = "handler";
const FAR_FUTURE: &str = "0 0 0 1 1 *";

fn mock_definition() -> JobDefinition {
    JobDefinition::new(
        format!("job-{}", uuid::Uuid::new_v4().simple()),
        FAR_FUTURE,
        HANDLER,
    )
}

/// Create test suite for a scheduler backend.
///
/// The backend under test must implement both [`JobStore`] and [`ExecutionLog`]. For backend
/// implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use bonfire_sched::test_suite;
/// use bonfire_sched::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead.
/// For example when the backend needs to be constructed asynchronously:
///
/// ```ignore
/// use bonfire_sched::test_suite;
/// test_suite!(
///     attr: tokio::test,
///     args: (),
///     backend: BackendImplementation::connect("sqlite::memory:").await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn create_job $args {
          let backend = $backend;
          $crate::backend::testing::create_job(backend).await;
        }
        #[$attr]
        async fn create_job_duplicate_name $args {
          let backend = $backend;
          $crate::backend::testing::create_job_duplicate_name(backend).await;
        }
        #[$attr]
        async fn create_job_invalid_schedule $args {
          let backend = $backend;
          $crate::backend::testing::create_job_invalid_schedule(backend).await;
        }
        #[$attr]
        async fn get_job_not_found $args {
          let backend = $backend;
          $crate::backend::testing::get_job_not_found(backend).await;
        }
        #[$attr]
        async fn update_job $args {
          let backend = $backend;
          $crate::backend::testing::update_job(backend).await;
        }
        #[$attr]
        async fn update_job_keeps_status $args {
          let backend = $backend;
          $crate::backend::testing::update_job_keeps_status(backend).await;
        }
        #[$attr]
        async fn update_job_not_found $args {
          let backend = $backend;
          $crate::backend::testing::update_job_not_found(backend).await;
        }
        #[$attr]
        async fn update_job_invalid_schedule $args {
          let backend = $backend;
          $crate::backend::testing::update_job_invalid_schedule(backend).await;
        }
        #[$attr]
        async fn update_job_duplicate_name $args {
          let backend = $backend;
          $crate::backend::testing::update_job_duplicate_name(backend).await;
        }
        #[$attr]
        async fn delete_job $args {
          let backend = $backend;
          $crate::backend::testing::delete_job(backend).await;
        }
        #[$attr]
        async fn delete_job_not_found $args {
          let backend = $backend;
          $crate::backend::testing::delete_job_not_found(backend).await;
        }
        #[$attr]
        async fn set_status $args {
          let backend = $backend;
          $crate::backend::testing::set_status(backend).await;
        }
        #[$attr]
        async fn set_status_not_found $args {
          let backend = $backend;
          $crate::backend::testing::set_status_not_found(backend).await;
        }
        #[$attr]
        async fn set_next_fire_at $args {
          let backend = $backend;
          $crate::backend::testing::set_next_fire_at(backend).await;
        }
        #[$attr]
        async fn list_jobs $args {
          let backend = $backend;
          $crate::backend::testing::list_jobs(backend).await;
        }
        #[$attr]
        async fn list_jobs_paged $args {
          let backend = $backend;
          $crate::backend::testing::list_jobs_paged(backend).await;
        }
        #[$attr]
        async fn active_jobs $args {
          let backend = $backend;
          $crate::backend::testing::active_jobs(backend).await;
        }
        #[$attr]
        async fn open_execution $args {
          let backend = $backend;
          $crate::backend::testing::open_execution(backend).await;
        }
        #[$attr]
        async fn open_execution_single_flight $args {
          let backend = $backend;
          $crate::backend::testing::open_execution_single_flight(backend).await;
        }
        #[$attr]
        async fn finalize_execution $args {
          let backend = $backend;
          $crate::backend::testing::finalize_execution(backend).await;
        }
        #[$attr]
        async fn finalize_execution_once $args {
          let backend = $backend;
          $crate::backend::testing::finalize_execution_once(backend).await;
        }
        #[$attr]
        async fn finalize_execution_not_found $args {
          let backend = $backend;
          $crate::backend::testing::finalize_execution_not_found(backend).await;
        }
        #[$attr]
        async fn list_executions $args {
          let backend = $backend;
          $crate::backend::testing::list_executions(backend).await;
        }
        #[$attr]
        async fn executions_survive_job_deletion $args {
          let backend = $backend;
          $crate::backend::testing::executions_survive_job_deletion(backend).await;
        }
        #[$attr]
        async fn abandon_running $args {
          let backend = $backend;
          $crate::backend::testing::abandon_running(backend).await;
        }
        #[$attr]
        async fn prune_executions $args {
          let backend = $backend;
          $crate::backend::testing::prune_executions(backend).await;
        }
    };
}

#[doc(hidden)]
pub async fn create_job(backend: impl JobStore) {
    let definition = mock_definition()
        .with_group("reports")
        .with_params(serde_json::json!({ "format": "pdf" }))
        .with_concurrency_policy(ConcurrencyPolicy::ForbidConcurrent)
        .with_misfire_policy(MisfirePolicy::Skip)
        .with_retry(RetryPolicy::exponential(TimeDelta::seconds(1), 3));
    let id1 = backend.create(definition.clone()).await.unwrap();
    let id2 = backend.create(mock_definition()).await.unwrap();
    assert_ne!(id1, id2);

    let job = backend.get(&id1).await.unwrap();
    assert_eq!(job.id, id1);
    assert_eq!(job.name, definition.name);
    assert_eq!(job.group, "reports");
    assert_eq!(job.schedule, FAR_FUTURE);
    assert_eq!(job.target, definition.target);
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.concurrency_policy, ConcurrencyPolicy::ForbidConcurrent);
    assert_eq!(job.misfire_policy, MisfirePolicy::Skip);
    assert_eq!(job.retry, definition.retry);
    assert_eq!(job.next_fire_at, None);
}

#[doc(hidden)]
pub async fn create_job_duplicate_name(backend: impl JobStore) {
    let definition = mock_definition();
    backend.create(definition.clone()).await.unwrap();

    assert!(matches!(
        backend.create(definition.clone()).await,
        Err(BackendError::DuplicateName { .. })
    ));
    // Names only need to be unique within a group
    assert!(backend
        .create(definition.with_group("other"))
        .await
        .is_ok());
}

#[doc(hidden)]
pub async fn create_job_invalid_schedule(backend: impl JobStore) {
    let definition = mock_definition().with_schedule("not a cron expression");
    assert!(matches!(
        backend.create(definition).await,
        Err(BackendError::InvalidDefinition(InvalidDefinition::Schedule(_)))
    ));
    assert_eq!(
        backend
            .list(&JobFilter::default(), Page::default())
            .await
            .unwrap()
            .total,
        0
    );
}

#[doc(hidden)]
pub async fn get_job_not_found(backend: impl JobStore) {
    assert!(matches!(
        backend.get(&JobId::from("nonexistent")).await,
        Err(BackendError::JobNotFound(id)) if id.as_str() == "nonexistent"
    ));
}

#[doc(hidden)]
pub async fn update_job(backend: impl JobStore) {
    let id = backend.create(mock_definition()).await.unwrap();
    let updated = mock_definition()
        .with_schedule("0 30 * * * *")
        .with_params(serde_json::json!([1, 2, 3]))
        .with_misfire_policy(MisfirePolicy::Ignore);

    let job = backend.update(&id, updated.clone()).await.unwrap();
    assert_eq!(job.name, updated.name);
    assert_eq!(job.schedule, "0 30 * * * *");

    let job = backend.get(&id).await.unwrap();
    assert_eq!(job.name, updated.name);
    assert_eq!(job.schedule, "0 30 * * * *");
    assert_eq!(job.target.params, serde_json::json!([1, 2, 3]));
    assert_eq!(job.misfire_policy, MisfirePolicy::Ignore);
}

#[doc(hidden)]
pub async fn update_job_keeps_status(backend: impl JobStore) {
    let id = backend.create(mock_definition()).await.unwrap();
    backend.set_status(&id, JobStatus::Paused).await.unwrap();

    let job = backend.update(&id, mock_definition()).await.unwrap();
    assert_eq!(job.status, JobStatus::Paused);
    assert_eq!(backend.get(&id).await.unwrap().status, JobStatus::Paused);
}

#[doc(hidden)]
pub async fn update_job_not_found(backend: impl JobStore) {
    assert!(matches!(
        backend
            .update(&JobId::from("nonexistent"), mock_definition())
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn update_job_invalid_schedule(backend: impl JobStore) {
    let id = backend.create(mock_definition()).await.unwrap();
    assert!(matches!(
        backend
            .update(&id, mock_definition().with_schedule("61 * * * * *"))
            .await,
        Err(BackendError::InvalidDefinition(InvalidDefinition::Schedule(_)))
    ));
    assert_eq!(backend.get(&id).await.unwrap().schedule, FAR_FUTURE);
}

#[doc(hidden)]
pub async fn update_job_duplicate_name(backend: impl JobStore) {
    let taken = mock_definition();
    backend.create(taken.clone()).await.unwrap();
    let original = mock_definition();
    let id = backend.create(original.clone()).await.unwrap();

    assert!(matches!(
        backend.update(&id, taken).await,
        Err(BackendError::DuplicateName { .. })
    ));
    // Keeping its own name is not a conflict
    assert!(backend.update(&id, original).await.is_ok());
}

#[doc(hidden)]
pub async fn delete_job(backend: impl JobStore) {
    let id = backend.create(mock_definition()).await.unwrap();
    backend.delete(&id).await.unwrap();
    assert!(matches!(backend.get(&id).await, Err(BackendError::JobNotFound(_))));
    assert!(matches!(backend.delete(&id).await, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn delete_job_not_found(backend: impl JobStore) {
    assert!(matches!(
        backend.delete(&JobId::from("nonexistent")).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn set_status(backend: impl JobStore) {
    let id = backend.create(mock_definition()).await.unwrap();

    let transition = backend.set_status(&id, JobStatus::Paused).await.unwrap();
    assert_eq!(transition.previous, JobStatus::Active);
    assert_eq!(transition.job.status, JobStatus::Paused);
    assert!(transition.changed());

    let transition = backend.set_status(&id, JobStatus::Paused).await.unwrap();
    assert_eq!(transition.previous, JobStatus::Paused);
    assert!(!transition.changed());

    let transition = backend.set_status(&id, JobStatus::Active).await.unwrap();
    assert_eq!(transition.previous, JobStatus::Paused);
    assert_eq!(backend.get(&id).await.unwrap().status, JobStatus::Active);
}

#[doc(hidden)]
pub async fn set_status_not_found(backend: impl JobStore) {
    assert!(matches!(
        backend
            .set_status(&JobId::from("nonexistent"), JobStatus::Paused)
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn set_next_fire_at(backend: impl JobStore) {
    let id = backend.create(mock_definition()).await.unwrap();
    let next = Utc::now() + TimeDelta::hours(1);

    backend.set_next_fire_at(&id, Some(next)).await.unwrap();
    let stored = backend.get(&id).await.unwrap().next_fire_at.unwrap();
    assert_eq!(stored.timestamp_millis(), next.timestamp_millis());

    // Status changes leave the fire time alone
    backend.set_status(&id, JobStatus::Paused).await.unwrap();
    assert!(backend.get(&id).await.unwrap().next_fire_at.is_some());

    backend.set_next_fire_at(&id, None).await.unwrap();
    assert_eq!(backend.get(&id).await.unwrap().next_fire_at, None);

    assert!(matches!(
        backend
            .set_next_fire_at(&JobId::from("nonexistent"), None)
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn list_jobs(backend: impl JobStore) {
    let report = backend
        .create(mock_definition().with_name("nightly-report").with_group("reports"))
        .await
        .unwrap();
    let cleanup = backend
        .create(mock_definition().with_name("nightly-cleanup"))
        .await
        .unwrap();
    let _ = backend
        .create(mock_definition().with_name("weekly-report").with_group("reports"))
        .await
        .unwrap();
    backend.set_status(&cleanup, JobStatus::Paused).await.unwrap();

    let all = backend
        .list(&JobFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(all.total, 3);
    assert_eq!(all.items.len(), 3);

    let nightly = backend
        .list(&JobFilter::default().name_contains("nightly"), Page::default())
        .await
        .unwrap();
    assert_eq!(nightly.total, 2);

    let reports = backend
        .list(
            &JobFilter::default()
                .name_contains("nightly")
                .in_group("reports"),
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(reports.total, 1);
    assert_eq!(reports.items[0].id, report);

    let paused = backend
        .list(
            &JobFilter::default().with_status(JobStatus::Paused),
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(paused.total, 1);
    assert_eq!(paused.items[0].id, cleanup);
}

#[doc(hidden)]
pub async fn list_jobs_paged(backend: impl JobStore) {
    for _ in 0..7 {
        backend.create(mock_definition()).await.unwrap();
    }

    let first = backend
        .list(&JobFilter::default(), Page::new(1, 3))
        .await
        .unwrap();
    let third = backend
        .list(&JobFilter::default(), Page::new(3, 3))
        .await
        .unwrap();
    let beyond = backend
        .list(&JobFilter::default(), Page::new(4, 3))
        .await
        .unwrap();

    assert_eq!(first.total, 7);
    assert_eq!(first.items.len(), 3);
    assert_eq!(third.items.len(), 1);
    assert_eq!(beyond.total, 7);
    assert!(beyond.items.is_empty());
}

#[doc(hidden)]
pub async fn active_jobs(backend: impl JobStore) {
    let active = backend.create(mock_definition()).await.unwrap();
    let paused = backend.create(mock_definition()).await.unwrap();
    backend.set_status(&paused, JobStatus::Paused).await.unwrap();

    let jobs = backend.active_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, active);
}

#[doc(hidden)]
pub async fn open_execution(backend: impl ExecutionLog) {
    let job_id = JobId::from("job");
    let fired_at = Utc::now();
    let first = backend
        .open(&job_id, fired_at, ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();
    let second = backend
        .open(&job_id, fired_at, ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    for record in [first, second] {
        assert_eq!(record.job_id, job_id);
        assert_eq!(record.outcome, ExecutionOutcome::Running);
        assert_eq!(record.completed_at, None);
        assert_eq!(record.fired_at.timestamp_millis(), fired_at.timestamp_millis());
    }
}

#[doc(hidden)]
pub async fn open_execution_single_flight(backend: impl ExecutionLog) {
    let job_id = JobId::from("job");
    let running = backend
        .open(&job_id, Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
        .await
        .unwrap();
    assert_eq!(running.outcome, ExecutionOutcome::Running);

    let skipped = backend
        .open(&job_id, Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
        .await
        .unwrap();
    assert_eq!(skipped.outcome, ExecutionOutcome::Skipped);
    assert!(skipped.completed_at.is_some());
    assert_eq!(skipped.attempts, 0);

    // Other jobs are not affected
    let other = backend
        .open(&JobId::from("other"), Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
        .await
        .unwrap();
    assert_eq!(other.outcome, ExecutionOutcome::Running);

    backend
        .finalize(running.id, Completion::Succeeded, 1)
        .await
        .unwrap();
    let next = backend
        .open(&job_id, Utc::now(), ConcurrencyPolicy::ForbidConcurrent)
        .await
        .unwrap();
    assert_eq!(next.outcome, ExecutionOutcome::Running);
}

#[doc(hidden)]
pub async fn finalize_execution(backend: impl ExecutionLog) {
    let job_id = JobId::from("job");
    let succeeded = backend
        .open(&job_id, Utc::now(), ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();
    let failed = backend
        .open(&job_id, Utc::now(), ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();

    let record = backend
        .finalize(succeeded.id, Completion::Succeeded, 1)
        .await
        .unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::Succeeded);
    assert_eq!(record.error_detail, None);
    assert_eq!(record.attempts, 1);
    assert!(record.completed_at.is_some());

    let record = backend
        .finalize(failed.id, Completion::failed("boom"), 3)
        .await
        .unwrap();
    assert_eq!(record.outcome, ExecutionOutcome::Failed);
    assert_eq!(record.error_detail.as_deref(), Some("boom"));
    assert_eq!(record.attempts, 3);
}

#[doc(hidden)]
pub async fn finalize_execution_once(backend: impl ExecutionLog) {
    let record = backend
        .open(&JobId::from("job"), Utc::now(), ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();
    backend
        .finalize(record.id, Completion::Succeeded, 1)
        .await
        .unwrap();

    assert!(matches!(
        backend.finalize(record.id, Completion::failed("late"), 2).await,
        Err(BackendError::AlreadyFinalized {
            outcome: ExecutionOutcome::Succeeded,
            ..
        })
    ));
    let records = backend
        .list(&JobId::from("job"), Page::default())
        .await
        .unwrap();
    assert_eq!(records.items[0].outcome, ExecutionOutcome::Succeeded);
}

#[doc(hidden)]
pub async fn finalize_execution_not_found(backend: impl ExecutionLog) {
    assert!(matches!(
        backend
            .finalize(42.into(), Completion::Succeeded, 1)
            .await,
        Err(BackendError::ExecutionNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn list_executions(backend: impl ExecutionLog) {
    let job_id = JobId::from("job");
    let now = Utc::now();
    for minutes in [5, 1, 3] {
        backend
            .open(
                &job_id,
                now - TimeDelta::minutes(minutes),
                ConcurrencyPolicy::AllowConcurrent,
            )
            .await
            .unwrap();
    }
    backend
        .open(&JobId::from("other"), now, ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();

    let records = backend.list(&job_id, Page::default()).await.unwrap();
    assert_eq!(records.total, 3);
    let fired: Vec<_> = records
        .items
        .iter()
        .map(|record| record.fired_at.timestamp_millis())
        .collect();
    let expected: Vec<_> = [1, 3, 5]
        .into_iter()
        .map(|minutes| (now - TimeDelta::minutes(minutes)).timestamp_millis())
        .collect();
    assert_eq!(fired, expected);

    let second = backend.list(&job_id, Page::new(2, 2)).await.unwrap();
    assert_eq!(second.total, 3);
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].fired_at.timestamp_millis(), expected[2]);

    let none = backend
        .list(&JobId::from("nonexistent"), Page::default())
        .await
        .unwrap();
    assert_eq!(none.total, 0);
    assert!(none.items.is_empty());
}

#[doc(hidden)]
pub async fn executions_survive_job_deletion<B: JobStore + ExecutionLog>(backend: B) {
    let id = JobStore::create(&backend, mock_definition()).await.unwrap();
    backend
        .open(&id, Utc::now(), ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();
    JobStore::delete(&backend, &id).await.unwrap();

    let records = ExecutionLog::list(&backend, &id, Page::default())
        .await
        .unwrap();
    assert_eq!(records.total, 1);
}

#[doc(hidden)]
pub async fn abandon_running(backend: impl ExecutionLog) {
    let job_id = JobId::from("job");
    let done = backend
        .open(&job_id, Utc::now(), ConcurrencyPolicy::AllowConcurrent)
        .await
        .unwrap();
    backend
        .finalize(done.id, Completion::Succeeded, 1)
        .await
        .unwrap();
    for _ in 0..2 {
        backend
            .open(&job_id, Utc::now(), ConcurrencyPolicy::AllowConcurrent)
            .await
            .unwrap();
    }

    assert_eq!(backend.abandon_running("interrupted").await.unwrap(), 2);
    assert_eq!(backend.abandon_running("interrupted").await.unwrap(), 0);

    let records = backend.list(&job_id, Page::default()).await.unwrap();
    assert!(records.items.iter().all(|record| !record.is_running()));
    assert_eq!(
        records
            .items
            .iter()
            .filter(|record| record.error_detail.as_deref() == Some("interrupted"))
            .count(),
        2
    );
}

#[doc(hidden)]
pub async fn prune_executions(backend: impl ExecutionLog) {
    let now = Utc::now();
    let job_ids = [JobId::from("job"), JobId::from("other")];
    for job_id in &job_ids {
        for hours in 0..20 {
            let record = backend
                .open(
                    job_id,
                    now - TimeDelta::hours(hours),
                    ConcurrencyPolicy::AllowConcurrent,
                )
                .await
                .unwrap();
            let completion = if hours % 2 == 0 {
                Completion::Succeeded
            } else {
                Completion::failed("boom")
            };
            backend.finalize(record.id, completion, 1).await.unwrap();
        }
        // Running records are never pruned
        backend
            .open(
                job_id,
                now - TimeDelta::days(30),
                ConcurrencyPolicy::AllowConcurrent,
            )
            .await
            .unwrap();
    }
    // Nothing old enough
    let pruned = backend
        .prune(&PruneSpec {
            outcomes: vec![ExecutionOutcome::Succeeded],
            prune_by: PruneBy::MaxAge(TimeDelta::days(2)),
        })
        .await
        .unwrap();
    assert_eq!(pruned, 0);

    // Failures fired at hours 11, 13, 15, 17 and 19, for both jobs
    let pruned = backend
        .prune(&PruneSpec {
            outcomes: vec![ExecutionOutcome::Failed],
            prune_by: PruneBy::MaxAge(TimeDelta::minutes(10 * 60 + 30)),
        })
        .await
        .unwrap();
    assert_eq!(pruned, 10);
    assert_eq!(
        backend.list(&job_ids[0], Page::default()).await.unwrap().total,
        16
    );

    // Keep the 4 most recent successes per job
    let pruned = backend
        .prune(&PruneSpec {
            outcomes: vec![ExecutionOutcome::Succeeded],
            prune_by: PruneBy::MaxLength(4),
        })
        .await
        .unwrap();
    assert_eq!(pruned, 12);
    for job_id in &job_ids {
        let records = backend.list(job_id, Page::new(1, 50)).await.unwrap();
        assert_eq!(records.total, 10);
        let oldest_success = records
            .items
            .iter()
            .filter(|record| record.outcome == ExecutionOutcome::Succeeded)
            .map(|record| record.fired_at)
            .min()
            .unwrap();
        assert!(oldest_success > now - TimeDelta::hours(7));
        assert_eq!(
            records
                .items
                .iter()
                .filter(|record| record.is_running())
                .count(),
            1
        );
    }
}
