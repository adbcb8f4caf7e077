//! Periodic housekeeping: retention purge and replay of stale sagas.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use saga_store::SagaStore;
use serde::de::DeserializeOwned;

use crate::channel::MessageChannel;
use crate::error::{Result, SagaError};
use crate::orchestrator::{Dispatch, Orchestrator};
use crate::retry::{RetryPolicy, retry_with_backoff};

const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Settings for [`SagaMaintenance`].
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Sagas and dead-lettered messages older than this are deleted,
    /// whatever their status.
    pub retention: Duration,
    pub purge_interval: Duration,
    /// `IN_PROGRESS` sagas idle this long are replayed.
    pub stale_after: Duration,
    pub replay_interval: Duration,
    /// Replays per saga before it is reported as stalled.
    pub max_replays: i32,
    /// Sagas replayed per pass.
    pub batch: usize,
    /// Retry applied to the purge statement.
    pub retry: RetryPolicy,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            purge_interval: Duration::from_secs(60 * 60),
            stale_after: Duration::from_secs(5 * 60),
            replay_interval: Duration::from_secs(60),
            max_replays: 3,
            batch: 100,
            retry: RetryPolicy::new(3),
        }
    }
}

/// Counts from one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub sagas: u64,
    pub dead_letters: u64,
}

/// Counts from one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub stalled: usize,
    pub failed: usize,
}

/// Housekeeping for one workflow.
pub struct SagaMaintenance<T, S, C> {
    orchestrator: Arc<Orchestrator<T, S, C>>,
    config: MaintenanceConfig,
}

impl<T, S, C> SagaMaintenance<T, S, C>
where
    T: DeserializeOwned + Send + 'static,
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    pub fn new(orchestrator: Arc<Orchestrator<T, S, C>>, config: MaintenanceConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Deletes sagas and dead-lettered messages past the retention period.
    pub async fn purge_once(&self) -> Result<PurgeReport> {
        let retention = to_chrono(self.config.retention);
        let service = self.orchestrator.service();
        let channel = self.orchestrator.channel();

        let sagas = retry_with_backoff(&self.config.retry, "purge_sagas", || {
            service.purge_older_than(retention)
        })
        .await?;
        let dead_letters = retry_with_backoff(&self.config.retry, "purge_dead_letters", || async {
            channel
                .purge_dead_letters(self.config.retention)
                .await
                .map_err(SagaError::from)
        })
        .await?;

        Ok(PurgeReport {
            sagas,
            dead_letters,
        })
    }

    /// Replays every stale saga of the workflow that still has replays
    /// left, up to `batch`.
    ///
    /// Sagas that used up their replays are left `IN_PROGRESS`; each is
    /// reported as stalled once, then ignored.
    #[tracing::instrument(skip(self), fields(saga = %self.orchestrator.name()))]
    pub async fn replay_stale_once(&self) -> Result<ReplayReport> {
        let service = self.orchestrator.service();
        let name = self.orchestrator.name();
        let idle = to_chrono(self.config.stale_after);
        let mut report = ReplayReport::default();

        let stalled = service
            .find_stalled(name, idle, self.config.max_replays, self.config.batch)
            .await?;
        for saga in stalled {
            match service.mark_stalled(saga.saga_id).await {
                Ok(_) => report.stalled += 1,
                Err(e) => {
                    tracing::warn!(saga_id = %saga.saga_id, error = %e, "failed to mark saga stalled");
                    report.failed += 1;
                }
            }
        }

        let stale = service
            .find_stale(name, idle, self.config.max_replays, self.config.batch)
            .await?;
        for saga in stale {
            match self.orchestrator.replay_saga(saga.saga_id).await {
                Ok(Dispatch::Ignored(_)) => {}
                Ok(_) => report.replayed += 1,
                Err(e) => {
                    tracing::warn!(saga_id = %saga.saga_id, error = %e, "saga replay failed");
                    report.failed += 1;
                }
            }
        }

        if report != ReplayReport::default() {
            tracing::info!(
                replayed = report.replayed,
                stalled = report.stalled,
                failed = report.failed,
                "stale saga pass finished"
            );
        }
        Ok(report)
    }

    /// Runs both jobs on their intervals until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut purge = tokio::time::interval(self.config.purge_interval.max(MIN_INTERVAL));
        let mut replay = tokio::time::interval(self.config.replay_interval.max(MIN_INTERVAL));
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        replay.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(saga = %self.orchestrator.name(), "saga maintenance started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = purge.tick() => {
                    if let Err(e) = self.purge_once().await {
                        tracing::error!(error = %e, "saga purge failed");
                    }
                }
                _ = replay.tick() => {
                    if let Err(e) = self.replay_stale_once().await {
                        tracing::error!(error = %e, "stale saga pass failed");
                    }
                }
            }
        }

        tracing::info!(saga = %self.orchestrator.name(), "saga maintenance stopped");
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
