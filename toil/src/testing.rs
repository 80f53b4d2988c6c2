//! Store instrumentation shared by unit tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::{
    job::{CompletionId, CompletionRecord, Job, JobId, NewJob},
    store::{memory::InMemoryStore, NewCompletion, Store, StoreError},
};

/// Counts every store call, optionally delegating to an [`InMemoryStore`].
///
/// Without a delegate every operation succeeds vacuously, which is enough to
/// assert that argument validation happens before any I/O.
#[derive(Debug, Clone, Default)]
pub(crate) struct CountingStore {
    calls: Arc<AtomicUsize>,
    inner: Option<InMemoryStore>,
}

impl CountingStore {
    pub(crate) fn delegating_to(inner: InMemoryStore) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            inner: Some(inner),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn insert(&self, job: NewJob) -> Result<Option<JobId>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.insert(job).await,
            None => Ok(None),
        }
    }

    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.fetch(queue, batch, now).await,
            None => Ok(Vec::new()),
        }
    }

    async fn mark_completed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.mark_completed(ids, output, now).await,
            None => Ok(Vec::new()),
        }
    }

    async fn mark_failed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.mark_failed(ids, output, now).await,
            None => Ok(Vec::new()),
        }
    }

    async fn mark_cancelled(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.mark_cancelled(ids, now).await,
            None => Ok(Vec::new()),
        }
    }

    async fn expire(&self, output: &Value, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.expire(output, now).await,
            None => Ok(Vec::new()),
        }
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.find_job(id).await,
            None => Ok(None),
        }
    }

    async fn push_completion(
        &self,
        completion: NewCompletion,
    ) -> Result<CompletionId, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.push_completion(completion).await,
            None => Ok(CompletionId::new()),
        }
    }

    async fn next_completion(
        &self,
        queue: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.next_completion(queue).await,
            None => Ok(None),
        }
    }

    async fn consume_completion(&self, id: CompletionId) -> Result<bool, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.consume_completion(id).await,
            None => Ok(false),
        }
    }

    async fn prune_completions(
        &self,
        retention: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.tick();
        match &self.inner {
            Some(inner) => inner.prune_completions(retention, now).await,
            None => Ok(0),
        }
    }
}
