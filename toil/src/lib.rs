//! A durable job queue backed by a relational store.
//!
//! Jobs are rows: enqueueing inserts a `created` row, workers lease rows into
//! `active` with row locking, and every outcome is a recorded state
//! transition. Failures of any shape (typed errors, arbitrary JSON, bare
//! strings, panics, timeouts) are normalized into queryable records; retries
//! spawn fresh rows instead of mutating history; finished jobs that asked for
//! it are archived for delivery to completion subscribers.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use toil::{store::memory::InMemoryStore, Toil, WorkOptions};
//!
//! # async fn example() -> Result<(), toil::ToilError> {
//! let toil = Toil::new(InMemoryStore::new()).with_worker(
//!     "invoices",
//!     |job: toil::Job| async move { Ok(Some(json!({"invoiced": job.data}))) },
//!     WorkOptions::default(),
//! )?;
//!
//! toil.send("invoices", json!({"amount": 100})).await?;
//! toil.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod dispatcher;
pub mod error;
pub mod job;
pub mod maintenance;
pub mod notifier;
pub mod retry;
pub mod store;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use error::{normalize, FailurePayload};
pub use job::{CompletionId, CompletionRecord, Job, JobId, JobIds, JobOptions, JobState};
pub use maintenance::MaintenanceConfig;
pub use notifier::CompletionHandler;
pub use retry::RetryPolicy;
pub use store::{Store, StoreError};
pub use worker::{Handler, WorkOptions};

use maintenance::Maintainer;
use notifier::CompletionNotifier;
use worker::WorkerHarness;

use std::time::Duration;

const SUBSCRIPTION_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ToilError {
    /// A lifecycle transition was requested without any job ids.
    #[error("at least one job id is required")]
    MissingJobIds,
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("a worker is already registered for queue `{0}`")]
    WorkerAlreadyRegistered(String),
    #[error("a completion subscription is already registered for queue `{0}`")]
    SubscriptionAlreadyRegistered(String),
    #[error("error communicating with the store")]
    Store(#[from] StoreError),
    #[error("error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
}

/// The queue instance: owns the dispatcher, registered workers, completion
/// subscriptions, and the maintainer.
pub struct Toil<S: Store> {
    dispatcher: Arc<Dispatcher<S>>,
    workers: HashMap<String, JoinHandle<()>>,
    subscriptions: HashMap<String, JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl<S> Toil<S>
where
    S: Store,
{
    pub fn new(store: S) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(store)),
            workers: Default::default(),
            subscriptions: Default::default(),
            maintenance: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Replaces the retry policy. Call before registering workers; once
    /// background tasks share the dispatcher the policy is fixed.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.dispatcher = match Arc::try_unwrap(self.dispatcher) {
            Ok(dispatcher) => Arc::new(dispatcher.with_retry_policy(retry)),
            Err(shared) => {
                tracing::warn!("retry policy ignored: background tasks already spawned");
                shared
            }
        };
        self
    }

    /// Registers a polling worker for the queue. At most one worker per
    /// queue per instance; the worker itself leases jobs in batches.
    pub fn with_worker<H>(
        mut self,
        queue: impl Into<String>,
        handler: H,
        options: WorkOptions,
    ) -> Result<Self, ToilError>
    where
        H: Handler,
    {
        let queue = Self::named(queue)?;
        if self.workers.contains_key(&queue) {
            return Err(ToilError::WorkerAlreadyRegistered(queue));
        }
        let handle = WorkerHarness::new(
            Arc::clone(&self.dispatcher),
            queue.clone(),
            handler,
            options,
            self.cancellation_token.clone(),
        )
        .spawn();
        self.workers.insert(queue, handle);
        Ok(self)
    }

    /// Subscribes a handler to the queue's completion records. Delivery is
    /// at least once: a record is only consumed after the handler returns
    /// `Ok`.
    pub fn with_subscriber<H>(
        mut self,
        queue: impl Into<String>,
        handler: H,
    ) -> Result<Self, ToilError>
    where
        H: CompletionHandler,
    {
        let queue = Self::named(queue)?;
        if self.subscriptions.contains_key(&queue) {
            return Err(ToilError::SubscriptionAlreadyRegistered(queue));
        }
        let handle = CompletionNotifier::new(
            Arc::clone(&self.dispatcher),
            queue.clone(),
            handler,
            SUBSCRIPTION_POLL_INTERVAL,
            self.cancellation_token.clone(),
        )
        .spawn();
        self.subscriptions.insert(queue, handle);
        Ok(self)
    }

    /// Starts the scheduled maintainer, which expires overdue jobs and
    /// prunes old completion records. Joined at shutdown like the workers.
    pub fn with_maintenance(mut self, config: MaintenanceConfig) -> Self {
        self.maintenance = Some(
            Maintainer::new(Arc::clone(&self.dispatcher), config)
                .spawn(self.cancellation_token.clone()),
        );
        self
    }

    /// Enqueues a job with default options. Returns `None` when a singleton
    /// key conflict suppressed the insert.
    pub async fn send(
        &self,
        queue: impl Into<String>,
        data: impl Serialize,
    ) -> Result<Option<JobId>, ToilError> {
        self.send_with(queue, data, JobOptions::default()).await
    }

    /// Enqueues a job with explicit options.
    pub async fn send_with(
        &self,
        queue: impl Into<String>,
        data: impl Serialize,
        options: JobOptions,
    ) -> Result<Option<JobId>, ToilError> {
        let queue = Self::named(queue)?;
        let data: Value = serde_json::to_value(data)?;
        Ok(self
            .dispatcher
            .store()
            .insert(options.into_new_job(queue, data))
            .await?)
    }

    /// Leases up to `batch` due jobs for external processing, bypassing any
    /// registered worker.
    pub async fn fetch(&self, queue: &str, batch: usize) -> Result<Vec<Job>, ToilError> {
        self.dispatcher.fetch(queue, batch).await
    }

    pub async fn complete(
        &self,
        ids: impl Into<JobIds>,
        result: Option<Value>,
    ) -> Result<Vec<Job>, ToilError> {
        self.dispatcher.complete(ids, result).await
    }

    pub async fn fail(
        &self,
        ids: impl Into<JobIds>,
        payload: impl Into<FailurePayload>,
    ) -> Result<Vec<Job>, ToilError> {
        self.dispatcher.fail(ids, payload).await
    }

    /// [`Toil::fail`] executed against a caller-supplied store capability,
    /// e.g. a session participating in the caller's transaction.
    pub async fn fail_on<T>(
        &self,
        ids: impl Into<JobIds>,
        payload: impl Into<FailurePayload>,
        store: &T,
    ) -> Result<Vec<Job>, ToilError>
    where
        T: Store + ?Sized,
    {
        self.dispatcher.fail_on(ids, payload, store).await
    }

    pub async fn cancel(&self, ids: impl Into<JobIds>) -> Result<Vec<Job>, ToilError> {
        self.dispatcher.cancel(ids).await
    }

    /// Forces overdue `active` jobs to `expired` immediately, without
    /// waiting for the next maintenance tick.
    pub async fn expire(&self) -> Result<Vec<Job>, ToilError> {
        self.dispatcher.expire().await
    }

    /// Pull-style completion delivery: the oldest unconsumed completion
    /// record for the queue, consumed on read.
    pub async fn fetch_completed(
        &self,
        queue: &str,
    ) -> Result<Option<CompletionRecord>, ToilError> {
        self.dispatcher.fetch_completed(queue).await
    }

    /// The queue's completion feed as a stream. Pull semantics: every
    /// yielded record has already been consumed.
    pub fn completion_stream<'a>(
        &'a self,
        queue: &'a str,
    ) -> impl futures::Stream<Item = Result<CompletionRecord, ToilError>> + 'a {
        async_stream::stream! {
            loop {
                match self.fetch_completed(queue).await {
                    Ok(Some(record)) => yield Ok(record),
                    Ok(None) => tokio::time::sleep(SUBSCRIPTION_POLL_INTERVAL).await,
                    Err(error) => yield Err(error),
                }
            }
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    /// Stops all workers, subscriptions, and the maintainer, waiting for
    /// in-flight handlers to settle their jobs.
    pub async fn graceful_shutdown(mut self) -> Result<(), ToilError> {
        tracing::debug!("shutting down queue tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(
            self.workers
                .drain()
                .chain(self.subscriptions.drain())
                .map(|(_, handle)| handle)
                .chain(self.maintenance.take()),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<()>, _>>()
        .map_err(|_| ToilError::GracefulShutdownFailed)?;
        Ok(())
    }

    fn named(queue: impl Into<String>) -> Result<String, ToilError> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(ToilError::EmptyQueueName);
        }
        Ok(queue)
    }
}
