use chrono::{DateTime, Utc};
use common::{EventOutcome, EventType, SagaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One processed event in a saga's append-only log.
///
/// Rows are never updated; they are removed only together with their saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEventState {
    /// Unique row id.
    pub id: Uuid,

    /// The saga this row belongs to.
    pub saga_id: SagaId,

    /// Type of the event that was processed.
    pub saga_event_state: EventType,

    /// Outcome of the event that was processed.
    pub saga_event_outcome: EventOutcome,

    /// 1-based position in the saga's log.
    pub saga_step_number: i32,

    /// The event payload as received.
    pub payload: String,

    pub create_date: DateTime<Utc>,
}

/// An event to be appended to a saga's log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEventState {
    pub event_type: EventType,
    pub event_outcome: EventOutcome,
    pub payload: String,
}

impl NewEventState {
    pub fn new(event_type: EventType, event_outcome: EventOutcome, payload: impl Into<String>) -> Self {
        Self {
            event_type,
            event_outcome,
            payload: payload.into(),
        }
    }

    /// Materializes the row at the given position in the log.
    pub fn into_row(self, saga_id: SagaId, step_number: i32, now: DateTime<Utc>) -> SagaEventState {
        SagaEventState {
            id: Uuid::new_v4(),
            saga_id,
            saga_event_state: self.event_type,
            saga_event_outcome: self.event_outcome,
            saga_step_number: step_number,
            payload: self.payload,
            create_date: now,
        }
    }
}
