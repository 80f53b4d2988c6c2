//! The durable-store capability boundary.
//!
//! The queue core never talks to a database directly; it drives a [`Store`],
//! which executes each logical operation as parameterized statements against
//! shared durable state. The store is the single source of truth and the only
//! synchronization point: exclusivity of `active` jobs is enforced by row
//! locking inside [`Store::fetch`], never by in-process mutexes.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::job::{CompletionId, CompletionRecord, Job, JobId, JobState, NewJob};

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying store could not execute a statement. Propagated
    /// unchanged to the caller of the operation that triggered it; the core
    /// never retries store errors.
    #[error("store unavailable")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("error encoding or decoding stored data")]
    Codec(#[from] serde_json::Error),
    #[error("store in bad state")]
    BadState,
}

/// An insertable completion record, before the archive has assigned an id.
#[derive(Debug, Clone)]
pub struct NewCompletion {
    pub job_id: JobId,
    pub queue: String,
    pub state: JobState,
    pub request: Value,
    pub response: Value,
    pub completed_on: DateTime<Utc>,
}

/// Durable storage for job rows and the completion archive.
///
/// Transition operations are idempotent per id: rows outside the expected
/// source state are silently skipped and only the transitioned rows are
/// returned.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Inserts a new `created` row. Returns `None` when the job's singleton
    /// key already has an outstanding (`created` or `active`) job in the
    /// queue.
    async fn insert(&self, job: NewJob) -> Result<Option<JobId>, StoreError>;

    /// Atomically leases up to `batch` due `created` jobs, transitioning each
    /// to `active` with `started_on = now`.
    ///
    /// Eligible rows are taken in `(priority desc, created_on asc)` order;
    /// rows locked by a concurrent fetch are skipped, never waited on. Two
    /// concurrent fetches never return the same job. An empty result is not
    /// an error.
    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// `active → completed` for each id; other states are skipped.
    async fn mark_completed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// `active | created → failed` for each id; other states are skipped.
    async fn mark_failed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// `active | created → cancelled` for each id; other states are skipped.
    async fn mark_cancelled(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Forces every `active` job whose `started_on + expire_in` has elapsed
    /// into `expired`, recording the given timeout output.
    async fn expire(&self, output: &Value, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Appends a record to the completion archive.
    async fn push_completion(
        &self,
        completion: NewCompletion,
    ) -> Result<CompletionId, StoreError>;

    /// The oldest unconsumed completion record for the queue, if any. Does
    /// not consume it.
    async fn next_completion(&self, queue: &str)
        -> Result<Option<CompletionRecord>, StoreError>;

    /// Marks a completion record consumed. Returns `false` when it was
    /// already consumed.
    async fn consume_completion(&self, id: CompletionId) -> Result<bool, StoreError>;

    /// Deletes consumed completion records older than the retention window.
    async fn prune_completions(
        &self,
        retention: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
