//! Persistence façade used by the orchestrator, the maintenance jobs and
//! callers that start sagas.

use chrono::Utc;
use common::{EventType, SagaId};
use saga_store::{
    Advanced, CorrelationIds, NewEventState, NewSaga, SagaAdvance, SagaEventState, SagaQuery,
    SagaRecord, SagaStatus, SagaStore, StoreError,
};

use crate::error::{Result, SagaError};
use crate::event::{Event, SYSTEM_USER};

/// Saga persistence operations on top of a [`SagaStore`].
///
/// Handlers never touch the store; all writes go through here.
#[derive(Debug, Clone)]
pub struct SagaService<S> {
    store: S,
}

impl<S: SagaStore> SagaService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Inserts a new `IN_PROGRESS` saga with no current step.
    #[tracing::instrument(skip(self, payload, correlation_ids))]
    pub async fn create_saga_record(
        &self,
        saga_name: &str,
        create_user: &str,
        payload: impl Into<String> + Send,
        correlation_ids: CorrelationIds,
    ) -> Result<SagaRecord> {
        let saga = self
            .store
            .insert_saga(
                NewSaga::new(saga_name, payload, create_user).correlation_ids(correlation_ids),
            )
            .await?;

        tracing::info!(saga_id = %saga.saga_id, "saga record created");
        Ok(saga)
    }

    /// Loads a saga, failing with [`SagaError::SagaNotFound`] if absent.
    pub async fn find_saga(&self, saga_id: SagaId) -> Result<SagaRecord> {
        self.store
            .get_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))
    }

    /// Records `event` in the saga's log and moves the saga to `next_state`
    /// with `status`, in one transaction.
    ///
    /// The write is rejected if the saga is no longer at the step `saga` was
    /// loaded with.
    #[tracing::instrument(skip(self, saga, event), fields(saga_id = %saga.saga_id))]
    pub async fn update_attached_saga_with_events(
        &self,
        saga: &SagaRecord,
        next_state: EventType,
        status: SagaStatus,
        event: &Event,
    ) -> Result<Advanced> {
        let advanced = self
            .store
            .append_event_and_advance(SagaAdvance {
                saga_id: saga.saga_id,
                expected_state: saga.saga_state.clone(),
                next_state,
                status,
                update_user: event.update_user().to_string(),
                event: NewEventState::new(
                    event.event_type().clone(),
                    event.event_outcome().clone(),
                    event.event_payload(),
                ),
            })
            .await?;

        Ok(advanced)
    }

    /// Finds the `IN_PROGRESS` saga of a workflow for a business key, if any.
    ///
    /// Callers use this before starting a saga for the same business entity.
    /// The check and the later insert are not atomic.
    pub async fn find_active(
        &self,
        saga_name: &str,
        key: &str,
        value: &str,
    ) -> Result<Option<SagaRecord>> {
        let sagas = self
            .store
            .query_sagas(
                SagaQuery::in_progress(saga_name)
                    .correlation(key, value)
                    .limit(1),
            )
            .await?;

        Ok(sagas.into_iter().next())
    }

    /// Returns the saga's log ordered by step number.
    pub async fn event_states(&self, saga_id: SagaId) -> Result<Vec<SagaEventState>> {
        Ok(self.store.get_event_states(saga_id).await?)
    }

    /// Moves an `IN_PROGRESS` saga to `FAILED`. Administrative action only;
    /// the engine itself never fails a saga.
    #[tracing::instrument(skip(self))]
    pub async fn mark_failed(&self, saga_id: SagaId, update_user: &str) -> Result<SagaRecord> {
        let saga = self
            .store
            .set_status(saga_id, SagaStatus::Failed, update_user)
            .await
            .map_err(|e| match e {
                StoreError::SagaNotFound(id) => SagaError::SagaNotFound(id),
                other => SagaError::Store(other),
            })?;

        tracing::warn!(saga_id = %saga.saga_id, "saga marked failed");
        metrics::counter!("saga_failed_total", "saga" => saga.saga_name.clone()).increment(1);
        Ok(saga)
    }

    /// Returns `IN_PROGRESS` sagas of a workflow that have not been updated
    /// for at least `idle` and were replayed fewer than `max_replays` times,
    /// oldest first.
    pub async fn find_stale(
        &self,
        saga_name: &str,
        idle: chrono::Duration,
        max_replays: i32,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        Ok(self
            .store
            .query_sagas(
                SagaQuery::in_progress(saga_name)
                    .updated_before(Utc::now() - idle)
                    .retry_count_below(max_replays)
                    .limit(limit),
            )
            .await?)
    }

    /// Returns stale `IN_PROGRESS` sagas that used their last replay and
    /// have not been reported as stalled yet.
    pub async fn find_stalled(
        &self,
        saga_name: &str,
        idle: chrono::Duration,
        max_replays: i32,
        limit: usize,
    ) -> Result<Vec<SagaRecord>> {
        Ok(self
            .store
            .query_sagas(
                SagaQuery::in_progress(saga_name)
                    .updated_before(Utc::now() - idle)
                    .retry_count_at_least(max_replays)
                    .retry_count_below(max_replays.saturating_add(1))
                    .limit(limit),
            )
            .await?)
    }

    /// Counts a replay against the saga and touches its update date.
    pub async fn record_replay(&self, saga_id: SagaId) -> Result<SagaRecord> {
        Ok(self
            .store
            .increment_retry_count(saga_id, SYSTEM_USER)
            .await?)
    }

    /// Moves a saga's `retry_count` past the replay bound so it is reported
    /// as stalled only once. The saga stays `IN_PROGRESS`.
    pub async fn mark_stalled(&self, saga_id: SagaId) -> Result<SagaRecord> {
        let saga = self
            .store
            .increment_retry_count(saga_id, SYSTEM_USER)
            .await?;

        tracing::warn!(
            saga_id = %saga.saga_id,
            saga_state = ?saga.saga_state,
            "saga stalled, replays exhausted"
        );
        metrics::counter!("saga_stalled_total", "saga" => saga.saga_name.clone()).increment(1);
        Ok(saga)
    }

    /// Deletes every saga created more than `retention` ago, whatever its
    /// status, together with its log.
    #[tracing::instrument(skip(self))]
    pub async fn purge_older_than(&self, retention: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let purged = self.store.purge_created_before(cutoff).await?;

        if purged > 0 {
            tracing::info!(purged, %cutoff, "purged expired sagas");
        }
        metrics::counter!("saga_purged_total").increment(purged);
        Ok(purged)
    }
}
