use common::{EventType, SagaId};
use thiserror::Error;

use crate::SagaStatus;

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The saga was not found (never created, or already purged).
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A saga with this id already exists.
    #[error("Saga already exists: {0}")]
    SagaAlreadyExists(SagaId),

    /// The saga's current step did not match the step the caller observed.
    /// Another worker advanced the saga first.
    #[error(
        "State conflict for saga {saga_id}: expected step {}, found {}",
        display_state(.expected),
        display_state(.actual)
    )]
    StateConflict {
        saga_id: SagaId,
        expected: Option<EventType>,
        actual: Option<EventType>,
    },

    /// The requested status change would move a saga backwards.
    #[error("Invalid status transition for saga {saga_id}: {from} -> {to}")]
    InvalidStatusTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// A stored row could not be mapped back to a saga type.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn display_state(state: &Option<EventType>) -> &str {
    state.as_ref().map_or("<none>", EventType::as_str)
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
