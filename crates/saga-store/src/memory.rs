use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use tokio::sync::RwLock;

use crate::{
    NewSaga, Result, SagaEventState, SagaQuery, SagaRecord, SagaStatus, StoreError,
    store::{Advanced, SagaAdvance, SagaStore, validate_advance, validate_status_change},
};

#[derive(Debug, Default)]
struct InMemoryState {
    sagas: HashMap<SagaId, SagaRecord>,
    events: Vec<SagaEventState>,
}

/// In-memory saga store implementation for testing.
///
/// This implementation keeps both tables behind one lock, so the
/// append-and-advance pairing is atomic exactly as in PostgreSQL.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.state.read().await.sagas.len()
    }

    /// Returns the total number of event rows stored.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Overwrites a saga's timestamps, used to simulate aged rows.
    pub async fn backdate(&self, saga_id: SagaId, to: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;
        saga.create_date = to;
        saga.update_date = to;
        Ok(())
    }

    /// Clears all sagas and events.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.sagas.clear();
        state.events.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert_saga(&self, saga: NewSaga) -> Result<SagaRecord> {
        let mut state = self.state.write().await;

        if state.sagas.contains_key(&saga.saga_id) {
            return Err(StoreError::SagaAlreadyExists(saga.saga_id));
        }

        let record = saga.into_record(Utc::now());
        state.sagas.insert(record.saga_id, record.clone());
        Ok(record)
    }

    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let state = self.state.read().await;
        Ok(state.sagas.get(&saga_id).cloned())
    }

    async fn append_event_and_advance(&self, advance: SagaAdvance) -> Result<Advanced> {
        let mut state = self.state.write().await;

        let current = state
            .sagas
            .get(&advance.saga_id)
            .ok_or(StoreError::SagaNotFound(advance.saga_id))?;
        validate_advance(current, &advance)?;

        let step_number = state
            .events
            .iter()
            .filter(|e| e.saga_id == advance.saga_id)
            .map(|e| e.saga_step_number)
            .max()
            .unwrap_or(0)
            + 1;

        let now = Utc::now();
        let event_state = advance.event.into_row(advance.saga_id, step_number, now);

        // Both writes happen under the same write guard.
        let saga = state
            .sagas
            .get_mut(&advance.saga_id)
            .ok_or(StoreError::SagaNotFound(advance.saga_id))?;
        saga.saga_state = Some(advance.next_state);
        saga.status = advance.status;
        saga.update_user = advance.update_user;
        saga.update_date = now;
        let saga = saga.clone();

        state.events.push(event_state.clone());

        Ok(Advanced { saga, event_state })
    }

    async fn get_event_states(&self, saga_id: SagaId) -> Result<Vec<SagaEventState>> {
        let state = self.state.read().await;
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.saga_id == saga_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.saga_step_number);
        Ok(events)
    }

    async fn query_sagas(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        let state = self.state.read().await;
        let mut sagas: Vec<_> = state
            .sagas
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();

        sagas.sort_by(|a, b| {
            a.create_date
                .cmp(&b.create_date)
                .then(a.saga_id.cmp(&b.saga_id))
        });

        if let Some(limit) = query.limit {
            sagas.truncate(limit);
        }

        Ok(sagas)
    }

    async fn set_status(
        &self,
        saga_id: SagaId,
        status: SagaStatus,
        update_user: &str,
    ) -> Result<SagaRecord> {
        let mut state = self.state.write().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;
        validate_status_change(saga, status)?;

        saga.status = status;
        saga.update_user = update_user.to_string();
        saga.update_date = Utc::now();
        Ok(saga.clone())
    }

    async fn increment_retry_count(
        &self,
        saga_id: SagaId,
        update_user: &str,
    ) -> Result<SagaRecord> {
        let mut state = self.state.write().await;
        let saga = state
            .sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        saga.retry_count += 1;
        saga.update_user = update_user.to_string();
        saga.update_date = Utc::now();
        Ok(saga.clone())
    }

    async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;

        let expired: Vec<SagaId> = state
            .sagas
            .values()
            .filter(|s| s.create_date < cutoff)
            .map(|s| s.saga_id)
            .collect();

        for saga_id in &expired {
            state.sagas.remove(saga_id);
        }
        state.events.retain(|e| !expired.contains(&e.saga_id));

        Ok(expired.len() as u64)
    }
}
