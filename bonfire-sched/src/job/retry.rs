//! Retry policies for transient execution failures.
//!
//! A retry happens inside a single fire: the execution record stays open while the executor is
//! retried and is finalized once with the number of attempts made.
//!
//! # Example
//!
//! ```
//! # use bonfire_sched::prelude::*;
//! # use chrono::TimeDelta;
//! let policy = RetryPolicy::exponential(TimeDelta::seconds(2), 4).with_max_delay(TimeDelta::seconds(5));
//!
//! assert_eq!(policy.delay(1), TimeDelta::seconds(2));
//! assert_eq!(policy.delay(2), TimeDelta::seconds(4));
//! assert_eq!(policy.delay(3), TimeDelta::seconds(5));
//! assert!(policy.should_retry(3));
//! assert!(!policy.should_retry(4));
//! ```
use chrono::TimeDelta;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A retry policy which can not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRetryPolicy {
    #[error("retry delays must not be negative, found {0}ms")]
    NegativeDelay(i64),
    #[error("jitter must be at most 100 percent, found {0}")]
    JitterOutOfRange(u8),
}

/// How delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Constant { delay_ms: i64 },
    Linear { step_ms: i64 },
    Exponential { base_ms: i64 },
}

/// Retry configuration carried by a [`crate::job::Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u16,
    pub backoff: Backoff,
    pub max_delay_ms: Option<i64>,
    /// Random jitter as a percentage of the computed delay.
    pub jitter_percent: u8,
}

impl RetryPolicy {
    pub fn constant(delay: TimeDelta, max_attempts: u16) -> Self {
        Self::new(
            Backoff::Constant {
                delay_ms: delay.num_milliseconds(),
            },
            max_attempts,
        )
    }

    pub fn linear(step: TimeDelta, max_attempts: u16) -> Self {
        Self::new(
            Backoff::Linear {
                step_ms: step.num_milliseconds(),
            },
            max_attempts,
        )
    }

    pub fn exponential(base: TimeDelta, max_attempts: u16) -> Self {
        Self::new(
            Backoff::Exponential {
                base_ms: base.num_milliseconds(),
            },
            max_attempts,
        )
    }

    fn new(backoff: Backoff, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            backoff,
            max_delay_ms: None,
            jitter_percent: 0,
        }
    }

    pub fn with_max_delay(mut self, max_delay: TimeDelta) -> Self {
        self.max_delay_ms = Some(max_delay.num_milliseconds());
        self
    }

    pub const fn with_jitter_percent(mut self, jitter_percent: u8) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Reject delays that are negative and jitter wider than the delay itself.
    pub fn validate(&self) -> Result<(), InvalidRetryPolicy> {
        let base = match self.backoff {
            Backoff::Constant { delay_ms } => delay_ms,
            Backoff::Linear { step_ms } => step_ms,
            Backoff::Exponential { base_ms } => base_ms,
        };
        if let Some(millis) = [Some(base), self.max_delay_ms]
            .into_iter()
            .flatten()
            .find(|millis| *millis < 0)
        {
            return Err(InvalidRetryPolicy::NegativeDelay(millis));
        }
        if self.jitter_percent > 100 {
            return Err(InvalidRetryPolicy::JitterOutOfRange(self.jitter_percent));
        }
        Ok(())
    }

    /// Whether another attempt may follow the given (1 based) attempt.
    pub fn should_retry(&self, attempt: u16) -> bool {
        attempt < self.max_attempts
    }

    /// The delay to wait after the given (1 based) failed attempt.
    pub fn delay(&self, attempt: u16) -> TimeDelta {
        let attempt = i64::from(attempt.max(1));
        let mut millis = match self.backoff {
            Backoff::Constant { delay_ms } => delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(attempt),
            Backoff::Exponential { base_ms } => 2_i64
                .checked_pow((attempt - 1) as u32)
                .and_then(|factor| base_ms.checked_mul(factor))
                .unwrap_or(i64::MAX),
        };
        if let Some(max) = self.max_delay_ms {
            millis = millis.min(max);
        }
        millis = millis.max(0);
        if self.jitter_percent > 0 {
            let spread = millis.saturating_mul(i64::from(self.jitter_percent)) / 100;
            millis = millis.saturating_add(rand::thread_rng().gen_range(-spread..=spread));
        }
        TimeDelta::milliseconds(millis.max(0))
    }
}
