use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use bonfire_sched::{backend::BackendError, prelude::*};
use bonfire_sched_sqlx::SqliteBackend;
use chrono::TimeDelta;
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_DATABASE_URL: &str = "sqlite://bonfire-demo.db";
const DATABASE_URL: &str = "DATABASE_URL";

#[tokio::main]
pub async fn main() -> Result<(), SchedulerError> {
    let db_url = std::env::var(DATABASE_URL).unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let backend = SqliteBackend::connect(&db_url).await?;
    let pruner = PrunerConfig::new(cron::Schedule::from_str("0 */5 * * * *").unwrap())
        .with_pruner(Pruner::max_length(20).only(ExecutionOutcome::Succeeded))
        .with_pruner(Pruner::max_age(TimeDelta::days(7)).only(ExecutionOutcome::Failed));
    let handle = Scheduler::from_backend(backend)
        .with_config(SchedulerConfig::new().with_max_concurrency(4))
        .with_executor::<GreetingExecutor>()
        .with_executor::<FlakyExecutor>()
        .with_pruner(pruner)
        .start()
        .await?;

    let greeting = ensure_job(
        &handle,
        JobDefinition::new("greeting", "*/5 * * * * *", GreetingExecutor::NAME)
            .with_params(serde_json::json!({ "name": "world" }))
            .with_misfire_policy(MisfirePolicy::Skip),
    )
    .await?;
    let flaky = ensure_job(
        &handle,
        JobDefinition::new("flaky", "*/10 * * * * *", FlakyExecutor::NAME)
            .with_concurrency_policy(ConcurrencyPolicy::ForbidConcurrent)
            .with_retry(RetryPolicy::exponential(TimeDelta::milliseconds(200), 3)),
    )
    .await?;

    let record = handle.run_job(&greeting).await?;
    tracing::info!(job_id = %greeting, execution_id = %record.id, "Ran job out of schedule");

    tokio::time::sleep(Duration::from_secs(12)).await;
    let report = handle.pause_jobs(&[flaky.clone()]).await?;
    tracing::info!(paused = report.results.len(), "Paused flaky job");

    tokio::time::sleep(Duration::from_secs(6)).await;
    handle.resume_jobs(&[flaky.clone()]).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = tokio::time::sleep(Duration::from_secs(15)) => {},
    }

    for id in [&greeting, &flaky] {
        let history = handle.list_execution_logs(id, Page::new(1, 5)).await?;
        println!("{id}: {} executions", history.total);
        for record in history.items {
            println!(
                "  {} fired at {} -> {:?} after {} attempts {}",
                record.id,
                record.fired_at,
                record.outcome,
                record.attempts,
                record.error_detail.unwrap_or_default(),
            );
        }
    }

    handle.graceful_shutdown().await
}

/// Create the job, or bring the stored job of the same name up to date.
async fn ensure_job(
    handle: &SchedulerHandle,
    definition: JobDefinition,
) -> Result<JobId, SchedulerError> {
    match handle.create_job(definition.clone()).await {
        Err(SchedulerError::Backend(BackendError::DuplicateName { .. })) => {
            let filter = JobFilter::default()
                .name_contains(definition.name.clone())
                .in_group(definition.group.clone());
            let existing = handle
                .list_jobs(&filter, Page::default())
                .await?
                .items
                .into_iter()
                .find(|job| job.name == definition.name)
                .ok_or(SchedulerError::Backend(BackendError::BadState))?;
            handle.update_job(&existing.id, definition).await?;
            handle.resume_jobs(&[existing.id.clone()]).await?;
            Ok(existing.id)
        }
        result => result,
    }
}

#[derive(Deserialize)]
struct Greeting {
    name: String,
}

struct GreetingExecutor;

#[async_trait]
impl Executor for GreetingExecutor {
    type Params = Greeting;
    const NAME: &'static str = "greeting";

    async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult {
        println!(
            "Hello {} from {} (fired at {})",
            invocation.params.name, invocation.job_id, invocation.fired_at
        );
        ExecutionResult::Done
    }

    fn timeout(_invocation: &Invocation<Self::Params>) -> Option<Duration> {
        Some(Duration::from_secs(2))
    }
}

#[derive(Debug, Error)]
#[error("attempt {attempt} failed")]
struct FlakyError {
    attempt: u16,
}

impl ExecutionError for FlakyError {
    fn error_type(&self) -> &'static str {
        "flaky"
    }

    fn is_transient(&self) -> bool {
        true
    }
}

struct FlakyExecutor;

#[async_trait]
impl Executor for FlakyExecutor {
    type Params = ();
    const NAME: &'static str = "flaky";

    async fn execute(invocation: Invocation<Self::Params>) -> ExecutionResult {
        if invocation.attempt < 2 {
            return FlakyError {
                attempt: invocation.attempt,
            }
            .into();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        ExecutionResult::Done
    }
}
