use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use super::NewJob;

/// Per-send options for a job.
///
/// All options have defaults; the builder methods consume `self` so options
/// can be chained inline at the send site:
///
/// ```
/// # use toil::JobOptions;
/// # use chrono::TimeDelta;
/// let options = JobOptions::default()
///     .with_retry_limit(3)
///     .with_retry_delay(TimeDelta::seconds(5))
///     .with_retry_backoff(true)
///     .with_on_complete(true);
/// ```
#[derive(Debug, Clone)]
pub struct JobOptions {
    retry_limit: i32,
    retry_delay: TimeDelta,
    retry_backoff: bool,
    expire_in: TimeDelta,
    singleton_key: Option<String>,
    priority: i16,
    on_complete: bool,
    start_after: Option<DateTime<Utc>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            retry_limit: 0,
            retry_delay: TimeDelta::zero(),
            retry_backoff: false,
            expire_in: TimeDelta::minutes(15),
            singleton_key: None,
            priority: 0,
            on_complete: false,
            start_after: None,
        }
    }
}

impl JobOptions {
    /// Number of times a failed job is requeued before the failure is final.
    pub fn with_retry_limit(self, retry_limit: i32) -> Self {
        Self {
            retry_limit,
            ..self
        }
    }

    /// Base delay before a retry becomes visible to `fetch`.
    pub fn with_retry_delay(self, retry_delay: TimeDelta) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    /// Grow the retry delay exponentially with each attempt instead of
    /// keeping it fixed.
    pub fn with_retry_backoff(self, retry_backoff: bool) -> Self {
        Self {
            retry_backoff,
            ..self
        }
    }

    /// How long the job may stay `active` before the expiration sweep forces
    /// it to `expired`.
    pub fn with_expire_in(self, expire_in: TimeDelta) -> Self {
        Self { expire_in, ..self }
    }

    /// Allow at most one outstanding job with this key per queue.
    pub fn with_singleton_key(self, singleton_key: impl Into<String>) -> Self {
        Self {
            singleton_key: Some(singleton_key.into()),
            ..self
        }
    }

    /// Higher priorities are fetched first.
    pub fn with_priority(self, priority: i16) -> Self {
        Self { priority, ..self }
    }

    /// Archive the terminal outcome for completion subscribers regardless of
    /// whether the job succeeded.
    pub fn with_on_complete(self, on_complete: bool) -> Self {
        Self {
            on_complete,
            ..self
        }
    }

    /// Delay the job's visibility until the given instant.
    pub fn start_at(self, start_after: DateTime<Utc>) -> Self {
        Self {
            start_after: Some(start_after),
            ..self
        }
    }

    /// Delay the job's visibility by the given duration.
    pub fn start_in(self, delay: TimeDelta) -> Self {
        Self {
            start_after: Some(Utc::now() + delay),
            ..self
        }
    }

    pub(crate) fn into_new_job(self, queue: String, data: Value) -> NewJob {
        NewJob {
            queue,
            data,
            retry_count: 0,
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
            expire_in: self.expire_in,
            singleton_key: self.singleton_key,
            priority: self.priority,
            on_complete: self.on_complete,
            start_after: self.start_after.unwrap_or_else(Utc::now),
        }
    }
}
