//! Retry decisions for failed jobs.
//!
//! A retry is never a mutation of the failed row: when a job still has retry
//! budget, a new `created` row is spawned with an incremented attempt count
//! and delayed visibility, and the failed row stays behind as history. The
//! policy decides only *whether* and *when* the replacement becomes visible.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use crate::job::Job;

/// Decides whether a failed job is requeued and how long its replacement is
/// delayed.
///
/// The per-job `retry_delay`/`retry_backoff` fields select a fixed or
/// exponential delay; the policy caps the delay and can widen it with a
/// relative jitter margin so coordinated retries spread out.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_delay: TimeDelta,
    jitter: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_delay: TimeDelta::days(7),
            jitter: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_delay(self, max_delay: TimeDelta) -> Self {
        Self { max_delay, ..self }
    }

    /// Applies a relative jitter margin, e.g. `0.1` for +/- 10%.
    pub fn with_jitter(self, fraction: f64) -> Self {
        Self {
            jitter: Some(fraction),
            ..self
        }
    }

    /// When the job still has retry budget, the instant its replacement row
    /// becomes visible; `None` when the failure is final.
    pub(crate) fn next_start_after(&self, job: &Job, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if job.retry_count >= job.retry_limit {
            return None;
        }
        Some(now + self.delay(job))
    }

    fn delay(&self, job: &Job) -> TimeDelta {
        let mut delay = if job.retry_backoff {
            let factor = 2_i64
                .checked_pow(job.retry_count.max(0) as u32)
                .unwrap_or(i64::MAX);
            // Saturated products are clamped to the cap before the delta is
            // built; TimeDelta::seconds itself panics near i64::MAX.
            let seconds = job
                .retry_delay
                .num_seconds()
                .max(1)
                .checked_mul(factor)
                .unwrap_or(i64::MAX)
                .min(self.max_delay.num_seconds());
            TimeDelta::seconds(seconds)
        } else {
            job.retry_delay
        };
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        if let Some(fraction) = self.jitter {
            let margin = (delay.num_milliseconds() as f64 * fraction) as i64;
            if margin > 0 {
                let offset = rand::thread_rng().gen_range(-margin..=margin);
                delay = delay + TimeDelta::milliseconds(offset);
            }
        }
        delay.max(TimeDelta::zero())
    }
}
