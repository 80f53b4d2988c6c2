//! Scheduled background upkeep: expiring overdue jobs and pruning the
//! completion archive.
//!
//! The maintainer runs on a [`cron::Schedule`]. Each tick it forces overdue
//! `active` jobs into `expired` and deletes consumed completion records older
//! than the retention window. How frequently it should run depends on the
//! tightest `expire_in` used by the system's queues; the default schedule
//! fires once a minute.

use std::ops::Sub;
use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{dispatcher::Dispatcher, store::Store};

const DEFAULT_SCHEDULE: &str = "0 * * * * *";

/// When and how aggressively maintenance runs.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    schedule: cron::Schedule,
    completed_retention: TimeDelta,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            schedule: cron::Schedule::from_str(DEFAULT_SCHEDULE)
                .unwrap_or_else(|_| unreachable!("default schedule is valid")),
            completed_retention: TimeDelta::days(7),
        }
    }
}

impl MaintenanceConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            ..Default::default()
        }
    }

    /// How long consumed completion records are kept before pruning.
    pub fn with_completed_retention(self, completed_retention: TimeDelta) -> Self {
        Self {
            completed_retention,
            ..self
        }
    }
}

pub(crate) struct Maintainer<S> {
    dispatcher: std::sync::Arc<Dispatcher<S>>,
    config: MaintenanceConfig,
}

impl<S> Maintainer<S>
where
    S: Store,
{
    pub(crate) fn new(
        dispatcher: std::sync::Arc<Dispatcher<S>>,
        config: MaintenanceConfig,
    ) -> Self {
        Self { dispatcher, config }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::warn!("maintenance schedule has no future occurrence, stopping");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.run_once().await;
                        let delay = next - Utc::now();
                        if delay > TimeDelta::zero() {
                            if let Ok(delay) = delay.to_std() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("shutting down the maintainer");
                        break;
                    },
                }
            }
        })
    }

    pub(crate) async fn run_once(&self) {
        if let Err(error) = self.dispatcher.expire().await {
            tracing::error!(?error, "failed to expire overdue jobs");
        }
        match self
            .dispatcher
            .store()
            .prune_completions(self.config.completed_retention, Utc::now())
            .await
        {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "pruned consumed completion records"),
            Err(error) => tracing::error!(?error, "failed to prune completion records"),
        }
    }
}
