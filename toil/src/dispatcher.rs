//! Concurrency-safe lifecycle transitions: fetch, complete, fail, cancel,
//! expire, and the archive reads backing completion delivery.

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::instrument;

use crate::{
    error::{normalize, FailurePayload},
    job::{CompletionRecord, Job, JobIds},
    retry::RetryPolicy,
    store::{NewCompletion, Store, StoreError},
    ToilError,
};

/// Executes lifecycle transitions against a [`Store`].
///
/// Every operation validates its arguments before any I/O, normalizes
/// failure payloads into stored records, and treats ids outside the expected
/// source state as silent no-ops so redelivery is always safe.
#[derive(Debug)]
pub struct Dispatcher<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S> Dispatcher<S>
where
    S: Store,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Leases up to `batch` due jobs from the queue, transitioning each to
    /// `active`. Returns an empty vec, never an error, when nothing is
    /// eligible.
    #[instrument(skip(self))]
    pub async fn fetch(&self, queue: &str, batch: usize) -> Result<Vec<Job>, ToilError> {
        Ok(self.store.fetch(queue, batch.max(1), Utc::now()).await?)
    }

    /// Transitions `active → completed` for each id, recording the result as
    /// the job's output. Ids not currently `active` are skipped.
    #[instrument(skip_all)]
    pub async fn complete(
        &self,
        ids: impl Into<JobIds>,
        result: Option<Value>,
    ) -> Result<Vec<Job>, ToilError> {
        self.complete_on(ids, result, &self.store).await
    }

    /// [`Dispatcher::complete`] executed against a caller-supplied store
    /// capability.
    pub async fn complete_on<T>(
        &self,
        ids: impl Into<JobIds>,
        result: Option<Value>,
        store: &T,
    ) -> Result<Vec<Job>, ToilError>
    where
        T: Store + ?Sized,
    {
        let ids = Self::required(ids)?;
        let output = result.unwrap_or_else(|| Value::Object(Map::new()));
        let completed = store
            .mark_completed(ids.as_slice(), &output, Utc::now())
            .await?;
        self.archive(&completed, store).await?;
        Ok(completed)
    }

    /// Transitions `active | created → failed` for each id, storing the
    /// normalized failure payload as the job's output.
    ///
    /// Jobs with retry budget left are respawned as new `created` rows with
    /// delayed visibility; final failures are archived when `on_complete`
    /// was requested. Ids outside the expected source states are skipped.
    #[instrument(skip_all)]
    pub async fn fail(
        &self,
        ids: impl Into<JobIds>,
        payload: impl Into<FailurePayload>,
    ) -> Result<Vec<Job>, ToilError> {
        self.fail_on(ids, payload, &self.store).await
    }

    /// [`Dispatcher::fail`] executed against a caller-supplied store
    /// capability, so the transition can participate in an externally
    /// managed transaction. Every statement of the operation, including the
    /// retry respawn and archival, runs through the supplied store.
    pub async fn fail_on<T>(
        &self,
        ids: impl Into<JobIds>,
        payload: impl Into<FailurePayload>,
        store: &T,
    ) -> Result<Vec<Job>, ToilError>
    where
        T: Store + ?Sized,
    {
        let ids = Self::required(ids)?;
        let output = normalize(&payload.into());
        let now = Utc::now();
        let failed = store.mark_failed(ids.as_slice(), &output, now).await?;

        for job in &failed {
            match self.retry.next_start_after(job, now) {
                Some(start_after) => {
                    tracing::debug!(
                        job_id = %job.id,
                        retry_count = job.retry_count + 1,
                        %start_after,
                        "requeueing failed job",
                    );
                    if store.insert(job.respawn(start_after)).await?.is_none() {
                        tracing::warn!(
                            job_id = %job.id,
                            "singleton key already outstanding, job will not be retried",
                        );
                    }
                }
                None => {
                    if job.on_complete {
                        self.archive_one(job, store).await?;
                    }
                }
            }
        }
        Ok(failed)
    }

    /// Transitions `active | created → cancelled` for each id.
    #[instrument(skip_all)]
    pub async fn cancel(&self, ids: impl Into<JobIds>) -> Result<Vec<Job>, ToilError> {
        let ids = Self::required(ids)?;
        let cancelled = self
            .store
            .mark_cancelled(ids.as_slice(), Utc::now())
            .await?;
        self.archive(&cancelled, &self.store).await?;
        Ok(cancelled)
    }

    /// Forces every overdue `active` job to `expired` with a timeout-kind
    /// output record. Driven periodically by the maintainer.
    #[instrument(skip(self))]
    pub async fn expire(&self) -> Result<Vec<Job>, ToilError> {
        let output = json!({
            "message": "job failed to complete within its expiration window",
            "kind": "timeout",
        });
        let expired = self.store.expire(&output, Utc::now()).await?;
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "expired overdue active jobs");
        }
        self.archive(&expired, &self.store).await?;
        Ok(expired)
    }

    /// Pull-based archive read: returns the oldest unconsumed completion
    /// record for the queue, consuming it.
    pub async fn fetch_completed(
        &self,
        queue: &str,
    ) -> Result<Option<CompletionRecord>, ToilError> {
        match self.store.next_completion(queue).await? {
            Some(record) => {
                self.store.consume_completion(record.id).await?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn required(ids: impl Into<JobIds>) -> Result<JobIds, ToilError> {
        let ids = ids.into();
        if ids.is_empty() {
            return Err(ToilError::MissingJobIds);
        }
        Ok(ids)
    }

    async fn archive<T>(&self, jobs: &[Job], store: &T) -> Result<(), StoreError>
    where
        T: Store + ?Sized,
    {
        for job in jobs.iter().filter(|job| job.on_complete) {
            self.archive_one(job, store).await?;
        }
        Ok(())
    }

    async fn archive_one<T>(&self, job: &Job, store: &T) -> Result<(), StoreError>
    where
        T: Store + ?Sized,
    {
        let completed_on = job.completed_on.unwrap_or_else(Utc::now);
        store
            .push_completion(NewCompletion {
                job_id: job.id,
                queue: job.queue.clone(),
                state: job.state,
                request: job.data.clone(),
                response: job
                    .output
                    .clone()
                    .unwrap_or_else(|| Value::Object(Map::new())),
                completed_on,
            })
            .await?;
        Ok(())
    }
}
