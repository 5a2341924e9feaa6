//! A SQLite backed [`JobStore`](bonfire_sched::backend::JobStore) and
//! [`ExecutionLog`](bonfire_sched::backend::ExecutionLog) for `bonfire_sched`.
//!
//! # Example
//!
//! ```no_run
//! # use bonfire_sched::prelude::*;
//! # use bonfire_sched_sqlx::SqliteBackend;
//! # async fn run() -> Result<(), SchedulerError> {
//! let backend = SqliteBackend::connect("sqlite://scheduler.db").await?;
//! let _handle = Scheduler::from_backend(backend).start().await?;
//! # Ok(())
//! # }
//! ```
use std::{ops::Deref, str::FromStr, time::Duration};

use bonfire_sched::{
    backend::BackendError,
    execution::{ExecutionId, ExecutionRecord},
    job::{Job, JobId},
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqliteExecutor, SqlitePool,
};

mod backend;
mod query;
mod types;

use types::{ExecutionRow, JobRow, Outcome, Status, EXECUTION_COLUMNS, JOB_COLUMNS};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Job store and execution log persisted in SQLite.
///
/// Clones share the same connection pool.
#[derive(Clone, Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl Deref for SqliteBackend {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl SqliteBackend {
    /// Connect to the database at `url`, creating it when missing, and run the migrations.
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(map_err)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// A private in memory database. Nothing is persisted.
    pub async fn in_memory() -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_err)?;
        // Every connection to `:memory:` opens a distinct database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Use an existing pool, running the migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, BackendError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .inspect_err(|err| tracing::error!(?err, "Failed to run migrations: {err}"))
            .map_err(BackendError::storage)?;
        Ok(Self { pool })
    }

    fn handle_update(result: sqlx::Result<u64>, job_id: &JobId) -> Result<(), BackendError> {
        match result {
            Ok(0) => Err(BackendError::JobNotFound(job_id.clone())),
            Ok(1) => Ok(()),
            Ok(_) => Err(BackendError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn insert_job(&self, row: &JobRow) -> sqlx::Result<()> {
        sqlx::query(&format!(
            "INSERT INTO bonfire_jobs ({JOB_COLUMNS}) \
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.job_group)
        .bind(&row.schedule)
        .bind(&row.target)
        .bind(row.status)
        .bind(row.concurrency_policy)
        .bind(row.misfire_policy)
        .bind(&row.retry)
        .bind(row.next_fire_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(self.deref())
        .await?;
        Ok(())
    }

    /// Replace the definition columns of a job, keeping its status. The stored next fire time
    /// is dropped when the schedule changes.
    async fn update_definition(&self, row: &JobRow) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as(&format!(
            "UPDATE bonfire_jobs SET \
                next_fire_at = CASE WHEN schedule = ?1 THEN next_fire_at ELSE NULL END, \
                schedule = ?1, \
                name = ?2, \
                job_group = ?3, \
                target = ?4, \
                concurrency_policy = ?5, \
                misfire_policy = ?6, \
                retry = ?7, \
                updated_at = ?8 \
            WHERE id = ?9 \
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(&row.schedule)
        .bind(&row.name)
        .bind(&row.job_group)
        .bind(&row.target)
        .bind(row.concurrency_policy)
        .bind(row.misfire_policy)
        .bind(&row.retry)
        .bind(row.updated_at)
        .bind(&row.id)
        .fetch_optional(self.deref())
        .await
    }

    /// Set the status of a job only if it is still `expected`.
    ///
    /// A single statement, so the write lock is taken up front and the busy timeout applies.
    async fn swap_status(
        &self,
        id: &JobId,
        expected: Status,
        status: Status,
        now: i64,
    ) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as(&format!(
            "UPDATE bonfire_jobs SET status = ?, updated_at = ? \
            WHERE id = ? AND status = ? \
            RETURNING {JOB_COLUMNS}"
        ))
        .bind(status)
        .bind(now)
        .bind(id.as_str())
        .bind(expected)
        .fetch_optional(self.deref())
        .await
    }

    async fn select_job<'e>(
        executor: impl SqliteExecutor<'e>,
        id: &JobId,
    ) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM bonfire_jobs WHERE id = ?"
        ))
        .bind(id.as_str())
        .fetch_optional(executor)
        .await
    }

    /// Insert a record, skipping it when the job has a running record and `single_flight` is
    /// set. The check and the insert happen in a single statement.
    async fn insert_execution(
        &self,
        job_id: &JobId,
        fired_at: i64,
        single_flight: bool,
        now: i64,
    ) -> sqlx::Result<ExecutionRow> {
        sqlx::query_as(&format!(
            "INSERT INTO bonfire_executions (job_id, fired_at, completed_at, outcome, attempts) \
            SELECT ?1, ?2, \
                CASE WHEN already_running THEN ?3 END, \
                CASE WHEN already_running THEN 'skipped' ELSE 'running' END, \
                0 \
            FROM (SELECT ?4 AND EXISTS ( \
                SELECT 1 FROM bonfire_executions WHERE job_id = ?1 AND outcome = 'running' \
            ) AS already_running) \
            RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(job_id.as_str())
        .bind(fired_at)
        .bind(now)
        .bind(single_flight)
        .fetch_one(self.deref())
        .await
    }

    async fn complete_execution(
        &self,
        id: ExecutionId,
        outcome: Outcome,
        error_detail: Option<String>,
        attempts: u16,
        now: i64,
    ) -> sqlx::Result<Option<ExecutionRow>> {
        sqlx::query_as(&format!(
            "UPDATE bonfire_executions SET \
                outcome = ?, \
                error_detail = ?, \
                attempts = ?, \
                completed_at = ? \
            WHERE id = ? AND outcome = 'running' \
            RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(outcome)
        .bind(error_detail)
        .bind(i64::from(attempts))
        .bind(now)
        .bind(i64::from(id))
        .fetch_optional(self.deref())
        .await
    }

    async fn execution_outcome(&self, id: ExecutionId) -> sqlx::Result<Option<Outcome>> {
        sqlx::query_scalar("SELECT outcome FROM bonfire_executions WHERE id = ?")
            .bind(i64::from(id))
            .fetch_optional(self.deref())
            .await
    }
}

fn map_err(error: sqlx::Error) -> BackendError {
    tracing::error!(?error, "Database error: {error}");
    BackendError::storage(error)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|error| error.is_unique_violation())
}

fn into_job(row: JobRow) -> Result<Job, BackendError> {
    row.try_into()
}

fn into_record(row: ExecutionRow) -> Result<ExecutionRecord, BackendError> {
    row.try_into()
}
