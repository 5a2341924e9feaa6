use bonfire_sched::{
    job::query::{JobFilter, Page},
    pruner::{PruneBy, PruneSpec},
};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};

use crate::types::{Outcome, Status, EXECUTION_COLUMNS, JOB_COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Sqlite>;
}

/// Selects one page of the matching jobs, newest first.
pub(crate) fn list_jobs(filter: &JobFilter, page: Page) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM bonfire_jobs"));
    push_filter(&mut builder, filter);
    builder.push(" ORDER BY created_at DESC, id ASC LIMIT ");
    builder.push_bind(page.limit() as i64);
    builder.push(" OFFSET ");
    builder.push_bind(page.offset() as i64);
    builder
}

pub(crate) fn count_jobs(filter: &JobFilter) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM bonfire_jobs");
    push_filter(&mut builder, filter);
    builder
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a JobFilter) {
    let mut conjunction = " WHERE";
    if let Some(name) = &filter.name_contains {
        builder.push(conjunction);
        builder.push(" instr(name, ");
        builder.push_bind(name.as_str());
        builder.push(") > 0");
        conjunction = " AND";
    }
    if let Some(group) = &filter.group {
        builder.push(conjunction);
        builder.push(" job_group = ");
        builder.push_bind(group.as_str());
        conjunction = " AND";
    }
    if let Some(status) = filter.status {
        builder.push(conjunction);
        builder.push(" status = ");
        builder.push_bind(Status::from(status));
    }
}

/// Selects one page of a job's executions, most recent fire first.
pub(crate) fn list_executions(job_id: &str, page: Page) -> QueryBuilder<'_, Sqlite> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {EXECUTION_COLUMNS} FROM bonfire_executions WHERE job_id = "
    ));
    builder.push_bind(job_id);
    builder.push(" ORDER BY fired_at DESC, id DESC LIMIT ");
    builder.push_bind(page.limit() as i64);
    builder.push(" OFFSET ");
    builder.push_bind(page.offset() as i64);
    builder
}

impl ToQuery for PruneSpec {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut builder = QueryBuilder::new("DELETE FROM bonfire_executions WHERE");
        match self.prune_by {
            PruneBy::MaxAge(age) => {
                push_outcomes(&mut builder, self);
                builder.push(" AND fired_at < ");
                builder.push_bind((Utc::now() - age).timestamp_millis());
            }
            PruneBy::MaxLength(length) => {
                builder.push(
                    " id IN (SELECT id FROM (SELECT id, ROW_NUMBER() OVER \
                    (PARTITION BY job_id ORDER BY fired_at DESC, id DESC) AS position \
                    FROM bonfire_executions WHERE",
                );
                push_outcomes(&mut builder, self);
                builder.push(") WHERE position > ");
                builder.push_bind(i64::from(length));
                builder.push(")");
            }
        }
        builder
    }
}

fn push_outcomes(builder: &mut QueryBuilder<'_, Sqlite>, spec: &PruneSpec) {
    builder.push(" outcome != 'running' AND outcome IN (");
    let mut separated = builder.separated(", ");
    for outcome in &spec.outcomes {
        separated.push_bind(Outcome::from(*outcome));
    }
    separated.push_unseparated(")");
}
