//! Polling workers that lease jobs and settle them through the dispatcher.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future::join_all, FutureExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    dispatcher::Dispatcher,
    error::FailurePayload,
    job::Job,
    store::Store,
};

/// A job handler.
///
/// Returning `Ok` completes the job with the given result; returning `Err`
/// fails it with the given payload. Panics and timeouts are captured by the
/// harness and recorded as kinded failure payloads, never crash the worker
/// loop.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<Option<Value>, FailurePayload>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<Value>, FailurePayload>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<Option<Value>, FailurePayload> {
        self(job).await
    }
}

/// Tuning for a single queue's worker.
#[derive(Debug, Clone)]
pub struct WorkOptions {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// When set, a handler still running after this long is aborted and its
    /// job failed with a timeout-kind payload.
    pub handler_timeout: Option<Duration>,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            poll_interval: Duration::from_secs(2),
            handler_timeout: None,
        }
    }
}

impl WorkOptions {
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_handler_timeout(self, handler_timeout: Duration) -> Self {
        Self {
            handler_timeout: Some(handler_timeout),
            ..self
        }
    }
}

/// Drives one queue: leases batches of due jobs, runs the handler on each,
/// and settles the outcome through the dispatcher.
pub(crate) struct WorkerHarness<S, H> {
    dispatcher: Arc<Dispatcher<S>>,
    queue: String,
    handler: Arc<H>,
    options: WorkOptions,
    token: CancellationToken,
}

impl<S, H> WorkerHarness<S, H>
where
    S: Store,
    H: Handler,
{
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher<S>>,
        queue: String,
        handler: H,
        options: WorkOptions,
        token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            handler: Arc::new(handler),
            options,
            token,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Leases batches and hands each job to its own settle task, so a slow
    /// handler never holds up intake of the next batch. On cancellation the
    /// in-flight tasks are drained before the worker reports stopped.
    async fn run(self) {
        tracing::debug!(queue = %self.queue, "worker started");
        let harness = Arc::new(self);
        let mut inflight: Vec<JoinHandle<()>> = Vec::new();
        {
            let batches = harness.batch_stream();
            tokio::pin!(batches);
            while let Some(batch) = batches.next().await {
                inflight.retain(|handle| !handle.is_finished());
                for job in batch {
                    let harness = Arc::clone(&harness);
                    inflight.push(tokio::spawn(async move { harness.settle(job).await }));
                }
            }
        }
        join_all(inflight).await;
        tracing::debug!(queue = %harness.queue, "worker stopped");
    }

    /// Yields non-empty batches of leased jobs until cancellation, sleeping
    /// the poll interval after each empty fetch.
    fn batch_stream(&self) -> impl futures::Stream<Item = Vec<Job>> + '_ {
        async_stream::stream! {
            loop {
                let batch = tokio::select! {
                    _ = self.token.cancelled() => break,
                    fetched = self.dispatcher.fetch(&self.queue, self.options.batch_size) => fetched,
                };
                match batch {
                    Ok(batch) if batch.is_empty() => {
                        tokio::select! {
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.options.poll_interval) => {},
                        }
                    }
                    Ok(batch) => yield batch,
                    Err(error) => {
                        tracing::error!(queue = %self.queue, ?error, "failed to fetch jobs");
                        tokio::select! {
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.options.poll_interval) => {},
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip(self, job), fields(queue = %self.queue, job_id = %job.id))]
    async fn settle(&self, job: Job) {
        let id = job.id;
        let outcome = self.execute(job).await;
        let settled = match outcome {
            Ok(result) => self.dispatcher.complete(id, result).await,
            Err(payload) => self.dispatcher.fail(id, payload).await,
        };
        if let Err(error) = settled {
            tracing::error!(job_id = %id, ?error, "failed to record job outcome");
        }
    }

    /// Runs the handler inside its own task so a panic is isolated, and
    /// enforces the optional handler timeout by aborting the task.
    async fn execute(&self, job: Job) -> Result<Option<Value>, FailurePayload> {
        let handler = Arc::clone(&self.handler);
        let mut task = tokio::spawn(async move {
            AssertUnwindSafe(handler.handle(job)).catch_unwind().await
        });
        let joined = match self.options.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(FailurePayload::timeout(limit));
                }
            },
            None => (&mut task).await,
        };
        match joined {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(panic)) => Err(FailurePayload::panic(panic_message(panic.as_ref()))),
            Err(join_error) if join_error.is_panic() => {
                Err(FailurePayload::panic(join_error.to_string()))
            }
            Err(join_error) => Err(FailurePayload::panic(format!(
                "handler task failed: {join_error}"
            ))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}
