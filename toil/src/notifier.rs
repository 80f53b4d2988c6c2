//! Push-style delivery of completion records to subscribers.
//!
//! Delivery is at least once: a record is consumed only after the handler
//! returns `Ok`, so a crash between delivery and consumption redelivers the
//! record on the next poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatcher::Dispatcher,
    job::CompletionRecord,
    store::Store,
};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Receives completion records for a queue.
#[async_trait]
pub trait CompletionHandler: Send + Sync + 'static {
    /// Returning `Err` leaves the record unconsumed for redelivery.
    async fn on_completion(&self, record: CompletionRecord) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> CompletionHandler for F
where
    F: Fn(CompletionRecord) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn on_completion(&self, record: CompletionRecord) -> Result<(), BoxError> {
        self(record).await
    }
}

/// Polls the completion archive for a queue and delivers each record to the
/// subscriber's handler.
pub(crate) struct CompletionNotifier<S, H> {
    dispatcher: Arc<Dispatcher<S>>,
    queue: String,
    handler: H,
    poll_interval: Duration,
    token: CancellationToken,
}

impl<S, H> CompletionNotifier<S, H>
where
    S: Store,
    H: CompletionHandler,
{
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher<S>>,
        queue: String,
        handler: H,
        poll_interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            handler,
            poll_interval,
            token,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        tracing::debug!(queue = %self.queue, "completion subscription started");
        let records = self.record_stream();
        tokio::pin!(records);
        while let Some(record) = records.next().await {
            let id = record.id;
            match self.handler.on_completion(record).await {
                Ok(()) => {
                    if let Err(error) = self.dispatcher.store().consume_completion(id).await {
                        tracing::error!(
                            completion_id = %id,
                            ?error,
                            "failed to consume delivered completion",
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        completion_id = %id,
                        ?error,
                        "completion handler failed, record will be redelivered",
                    );
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        tracing::debug!(queue = %self.queue, "completion subscription stopped");
    }

    /// Yields unconsumed records, oldest first, until cancellation. Records
    /// are not consumed here; consumption happens only after a successful
    /// delivery.
    fn record_stream(&self) -> impl futures::Stream<Item = CompletionRecord> + '_ {
        async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = self.token.cancelled() => break,
                    next = self.dispatcher.store().next_completion(&self.queue) => next,
                };
                match next {
                    Ok(Some(record)) => yield record,
                    Ok(None) => {
                        tokio::select! {
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.poll_interval) => {},
                        }
                    }
                    Err(error) => {
                        tracing::error!(queue = %self.queue, ?error, "failed to poll completions");
                        tokio::select! {
                            _ = self.token.cancelled() => break,
                            _ = tokio::time::sleep(self.poll_interval) => {},
                        }
                    }
                }
            }
        }
    }
}
