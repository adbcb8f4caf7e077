//! Consumes an orchestrator's topic and settles every delivery.

use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use saga_store::SagaStore;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::channel::{Delivery, MessageChannel};
use crate::error::Result;
use crate::orchestrator::Orchestrator;

/// Default number of deliveries processed at once.
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Runs an [`Orchestrator`] against its topic.
///
/// A delivery is acknowledged once dispatched, negatively acknowledged when
/// dispatch fails with a retriable error (the channel redelivers it after a
/// backoff), and rejected otherwise.
pub struct SagaWorker<T, S, C> {
    orchestrator: Arc<Orchestrator<T, S, C>>,
    concurrency: usize,
}

impl<T, S, C> SagaWorker<T, S, C>
where
    T: DeserializeOwned + Send + 'static,
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    pub fn new(orchestrator: Arc<Orchestrator<T, S, C>>) -> Self {
        Self {
            orchestrator,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Processes deliveries until `shutdown` resolves or the subscription
    /// ends, then waits for in-flight deliveries to settle.
    #[tracing::instrument(skip_all, fields(saga = %self.orchestrator.name(), topic = %self.orchestrator.topic()))]
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut deliveries = self
            .orchestrator
            .channel()
            .subscribe(self.orchestrator.topic())
            .await?;
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        tracing::info!(concurrency = self.concurrency, "saga worker started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let orchestrator = self.orchestrator.clone();
            tasks.spawn(async move {
                let _permit = permit;
                process(&orchestrator, delivery).await;
            });

            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "delivery task panicked");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "delivery task panicked");
            }
        }

        tracing::info!("saga worker stopped");
        Ok(())
    }
}

/// Dispatches one delivery and settles it with the channel.
pub async fn process<T, S, C>(orchestrator: &Orchestrator<T, S, C>, delivery: Delivery)
where
    T: DeserializeOwned + Send + 'static,
    S: SagaStore,
    C: MessageChannel,
{
    let settled = match orchestrator.handle_event(delivery.event()).await {
        Ok(dispatch) => {
            tracing::debug!(?dispatch, attempt = delivery.attempt(), "delivery processed");
            delivery.ack().await
        }
        Err(e) if e.is_retriable() => delivery.nack(&e.to_string()).await,
        Err(e) => {
            tracing::warn!(error = %e, "delivery can never succeed, rejecting it");
            delivery.reject(&e.to_string()).await
        }
    };

    if let Err(e) = settled {
        tracing::warn!(error = %e, "failed to settle delivery");
    }
}
