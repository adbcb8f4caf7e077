use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventType, SagaId};

use crate::{
    NewEventState, NewSaga, Result, SagaEventState, SagaQuery, SagaRecord, SagaStatus, StoreError,
};

/// Appends one event row and moves the saga's resumption pointer, atomically.
#[derive(Debug, Clone)]
pub struct SagaAdvance {
    pub saga_id: SagaId,

    /// The step the caller observed when it loaded the saga. The write fails
    /// with `StateConflict` if the saga has moved on since.
    pub expected_state: Option<EventType>,

    /// The step being recorded as the saga's current step.
    pub next_state: EventType,

    /// The status after the write; `IN_PROGRESS` or `COMPLETED`.
    pub status: SagaStatus,

    pub update_user: String,

    /// The incoming event being recorded.
    pub event: NewEventState,
}

/// The saga and log row as written by [`SagaStore::append_event_and_advance`].
#[derive(Debug, Clone)]
pub struct Advanced {
    pub saga: SagaRecord,
    pub event_state: SagaEventState,
}

/// Core trait for saga persistence.
///
/// The store exclusively owns the saga and event-state tables. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Inserts a new saga with status `IN_PROGRESS` and no current step.
    async fn insert_saga(&self, saga: NewSaga) -> Result<SagaRecord>;

    /// Retrieves a saga by id.
    ///
    /// Returns None if it doesn't exist.
    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaRecord>>;

    /// Appends an event row and updates the saga's step and status in one
    /// transaction. Either both writes land or neither does.
    async fn append_event_and_advance(&self, advance: SagaAdvance) -> Result<Advanced>;

    /// Retrieves a saga's log, ordered by step number.
    async fn get_event_states(&self, saga_id: SagaId) -> Result<Vec<SagaEventState>>;

    /// Retrieves sagas matching a query, oldest first.
    async fn query_sagas(&self, query: SagaQuery) -> Result<Vec<SagaRecord>>;

    /// Changes a saga's status without recording an event (administrative).
    async fn set_status(
        &self,
        saga_id: SagaId,
        status: SagaStatus,
        update_user: &str,
    ) -> Result<SagaRecord>;

    /// Increments the saga's retry counter and touches its update date.
    async fn increment_retry_count(&self, saga_id: SagaId, update_user: &str)
    -> Result<SagaRecord>;

    /// Deletes every saga created before `cutoff`, regardless of status,
    /// together with its event rows. Returns the number of sagas removed.
    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Retrieves a saga, failing with `SagaNotFound` if it doesn't exist.
    async fn require_saga(&self, saga_id: SagaId) -> Result<SagaRecord> {
        self.get_saga(saga_id)
            .await?
            .ok_or(StoreError::SagaNotFound(saga_id))
    }

    /// Checks if a saga exists.
    async fn saga_exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.get_saga(saga_id).await?.is_some())
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Checks an advance against the saga's current row.
///
/// Shared by every store so the rules cannot drift between backends.
pub fn validate_advance(current: &SagaRecord, advance: &SagaAdvance) -> Result<()> {
    if !current.status.can_transition_to(advance.status) {
        return Err(StoreError::InvalidStatusTransition {
            saga_id: current.saga_id,
            from: current.status,
            to: advance.status,
        });
    }

    if current.saga_state != advance.expected_state {
        return Err(StoreError::StateConflict {
            saga_id: current.saga_id,
            expected: advance.expected_state.clone(),
            actual: current.saga_state.clone(),
        });
    }

    Ok(())
}

/// Checks an administrative status change.
pub fn validate_status_change(current: &SagaRecord, status: SagaStatus) -> Result<()> {
    if current.status == status || !current.status.can_transition_to(status) {
        return Err(StoreError::InvalidStatusTransition {
            saga_id: current.saga_id,
            from: current.status,
            to: status,
        });
    }
    Ok(())
}
