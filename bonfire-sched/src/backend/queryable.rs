use crate::{
    execution::ExecutionRecord,
    job::{query::JobFilter, Job},
    pruner::PruneSpec,
};

pub(super) trait Queryable<T> {
    fn matches(&self, item: &T) -> bool;
}

impl Queryable<Job> for JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.name_contains
            .as_deref()
            .map_or(true, |name| job.name.contains(name))
            && self.group.as_deref().map_or(true, |group| job.group == group)
            && self.status.map_or(true, |status| job.status == status)
    }
}

impl Queryable<ExecutionRecord> for PruneSpec {
    fn matches(&self, record: &ExecutionRecord) -> bool {
        record.outcome.is_final() && self.outcomes.contains(&record.outcome)
    }
}

#[cfg(test)]
mod test {
    use crate::{
        execution::{Completion, ExecutionOutcome},
        job::JobStatus,
        pruner::Pruner,
    };
    use chrono::{TimeDelta, Utc};

    use super::*;

    #[test]
    fn filter_matches() {
        let mut job = Job::raw_job();
        job.name = "nightly-report".to_owned();
        job.group = "reports".to_owned();

        let matching = [
            JobFilter::default(),
            JobFilter::default().name_contains("report"),
            JobFilter::default().in_group("reports"),
            JobFilter::default().with_status(JobStatus::Active),
            JobFilter::default()
                .name_contains("nightly")
                .in_group("reports")
                .with_status(JobStatus::Active),
        ];
        matching
            .iter()
            .for_each(|filter| assert!(filter.matches(&job), "{filter:?}"));

        let non_matching = [
            JobFilter::default().name_contains("weekly"),
            JobFilter::default().in_group("report"),
            JobFilter::default().with_status(JobStatus::Paused),
            JobFilter::default().name_contains("nightly").in_group("other"),
        ];
        non_matching
            .iter()
            .for_each(|filter| assert!(!filter.matches(&job), "{filter:?}"));
    }

    #[test]
    fn prune_spec_never_matches_running() {
        let now = Utc::now();
        let spec: PruneSpec = Pruner::max_age(TimeDelta::days(1)).into();
        let mut record = ExecutionRecord::open(1.into(), "job".into(), now, false, now);
        assert!(!spec.matches(&record));

        record.complete(Completion::Succeeded, 1, now);
        assert!(spec.matches(&record));

        let spec: PruneSpec = Pruner::max_age(TimeDelta::days(1))
            .only(ExecutionOutcome::Failed)
            .into();
        assert!(!spec.matches(&record));
    }
}
