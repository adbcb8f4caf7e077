//! Saga error types.

use std::time::Duration;

use common::{EventOutcome, EventType, SagaId};
use saga_store::StoreError;
use thiserror::Error;

/// Errors raised while building a step graph.
///
/// These are configuration mistakes and are never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Two transitions share the same `(event type, outcome)` key.
    #[error("Transition ({event_type}, {event_outcome}) is registered twice")]
    DuplicateTransition {
        event_type: EventType,
        event_outcome: EventOutcome,
    },

    /// A non-terminal transition emits a type no other transition handles.
    #[error("Transition ({event_type}, {event_outcome}) emits {target}, which no transition handles")]
    DanglingTarget {
        event_type: EventType,
        event_outcome: EventOutcome,
        target: EventType,
    },

    /// A transition whose source type is never emitted by the graph.
    #[error("Transition ({event_type}, {event_outcome}) cannot be reached from the initial step")]
    UnreachableTransition {
        event_type: EventType,
        event_outcome: EventOutcome,
    },

    /// A step can be reached from itself.
    #[error("Step {0} is part of a cycle")]
    Cycle(EventType),

    /// `begin` was never called.
    #[error("No initial step registered")]
    MissingBegin,

    /// A transition uses `INITIATED` or `MARK_SAGA_COMPLETE`, which the engine owns.
    #[error("Transition ({event_type}, {event_outcome}) uses a key reserved by the engine")]
    ReservedKey {
        event_type: EventType,
        event_outcome: EventOutcome,
    },
}

/// Errors raised by a message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Failed to acknowledge delivery: {0}")]
    Acknowledge(String),

    #[error("Channel is closed")]
    Closed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The event references a saga that does not exist (or was purged).
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A step handler failed.
    #[error("Saga step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// A request/reply call inside a handler did not answer in time.
    #[error("Operation '{operation}' timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// A handler emitted an event of a different type than its transition declares.
    #[error("Handler for step {expected} emitted {actual}")]
    MisroutedEvent {
        expected: EventType,
        actual: EventType,
    },

    /// A non-terminal saga already exists for the business key.
    #[error("Saga {existing} is already active for {key}={value}")]
    AlreadyActive {
        existing: SagaId,
        key: String,
        value: String,
    },

    /// File generation collaborator error.
    #[error("File generation error: {0}")]
    FileGeneration(String),

    /// Downstream notification collaborator error.
    #[error("Notification error: {0}")]
    Notification(String),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] StoreError),

    /// Message channel error.
    #[error("Message channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Step graph construction error.
    #[error("Step graph error: {0}")]
    Graph(#[from] GraphError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if redelivering the same message may succeed.
    ///
    /// Collaborator failures, timeouts, lost optimistic checks and
    /// infrastructure errors are transient. Configuration and data errors
    /// fail the same way on every attempt.
    pub fn is_retriable(&self) -> bool {
        match self {
            SagaError::StepFailed { .. }
            | SagaError::Timeout { .. }
            | SagaError::FileGeneration(_)
            | SagaError::Notification(_)
            | SagaError::Channel(_) => true,
            SagaError::Store(e) => matches!(
                e,
                StoreError::StateConflict { .. } | StoreError::Database(_)
            ),
            SagaError::SagaNotFound(_)
            | SagaError::MisroutedEvent { .. }
            | SagaError::AlreadyActive { .. }
            | SagaError::Graph(_)
            | SagaError::Serialization(_) => false,
        }
    }

    /// A short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SagaError::SagaNotFound(_) => "saga_not_found",
            SagaError::StepFailed { .. } => "step_failed",
            SagaError::Timeout { .. } => "timeout",
            SagaError::MisroutedEvent { .. } => "misrouted_event",
            SagaError::AlreadyActive { .. } => "already_active",
            SagaError::FileGeneration(_) => "file_generation",
            SagaError::Notification(_) => "notification",
            SagaError::Store(_) => "store",
            SagaError::Channel(_) => "channel",
            SagaError::Graph(_) => "graph",
            SagaError::Serialization(_) => "serialization",
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
