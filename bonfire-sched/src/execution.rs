//! Execution history.
//!
//! Every fire of a job produces exactly one [`ExecutionRecord`]. A record is opened as
//! [`ExecutionOutcome::Running`] (or directly as [`ExecutionOutcome::Skipped`] when a single
//! flight job is already running) and finalized exactly once by the
//! [`coordinator::ExecutionCoordinator`].
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobId;

pub mod coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(i64);

impl From<i64> for ExecutionId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<ExecutionId> for i64 {
    fn from(value: ExecutionId) -> Self {
        value.0
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecutionId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl ExecutionOutcome {
    pub const ALL: [ExecutionOutcome; 4] = [
        ExecutionOutcome::Running,
        ExecutionOutcome::Succeeded,
        ExecutionOutcome::Failed,
        ExecutionOutcome::Skipped,
    ];

    pub fn is_final(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// One fire attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    /// Reference to the job. The job may since have been deleted.
    pub job_id: JobId,
    pub fired_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: ExecutionOutcome,
    /// Only present for [`ExecutionOutcome::Failed`].
    pub error_detail: Option<String>,
    /// Number of times the executor was invoked. Zero for skipped fires.
    pub attempts: u16,
}

impl ExecutionRecord {
    /// Open a record for a new fire.
    ///
    /// When `already_running` is set the record is created skipped and is final from the start.
    pub fn open(
        id: ExecutionId,
        job_id: JobId,
        fired_at: DateTime<Utc>,
        already_running: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let (outcome, completed_at) = if already_running {
            (ExecutionOutcome::Skipped, Some(now))
        } else {
            (ExecutionOutcome::Running, None)
        };
        Self {
            id,
            job_id,
            fired_at,
            completed_at,
            outcome,
            error_detail: None,
            attempts: 0,
        }
    }

    /// Apply the final outcome to a running record.
    pub fn complete(&mut self, completion: Completion, attempts: u16, now: DateTime<Utc>) {
        self.completed_at = Some(now);
        self.attempts = attempts;
        self.outcome = completion.outcome();
        self.error_detail = completion.into_error_detail();
    }

    pub fn is_running(&self) -> bool {
        self.outcome == ExecutionOutcome::Running
    }
}

/// How a running execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed { detail: String },
}

impl Completion {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
        }
    }

    pub fn outcome(&self) -> ExecutionOutcome {
        match self {
            Self::Succeeded => ExecutionOutcome::Succeeded,
            Self::Failed { .. } => ExecutionOutcome::Failed,
        }
    }

    pub fn into_error_detail(self) -> Option<String> {
        match self {
            Self::Succeeded => None,
            Self::Failed { detail } => Some(detail),
        }
    }
}
