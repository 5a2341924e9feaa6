//! The purpose of this module is to alleviate the need to import many of the `[bonfire_sched]`
//! types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use bonfire_sched::prelude::*;
//! ```
pub use crate::batch::{BatchReport, ItemError};
pub use crate::execution::{ExecutionOutcome, ExecutionRecord};
pub use crate::executor::{ExecutionError, ExecutionResult, Executor, Invocation};
pub use crate::job::query::{JobFilter, Page, Paged};
pub use crate::job::retry::RetryPolicy;
pub use crate::job::{
    ConcurrencyPolicy, InvocationTarget, Job, JobDefinition, JobId, JobStatus, MisfirePolicy,
};
pub use crate::pruner::{Pruner, PrunerConfig};
pub use crate::{Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle};
