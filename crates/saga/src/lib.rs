//! Message-driven saga orchestration.
//!
//! A workflow is a [`StepGraph`]: a table from `(event type, event outcome)`
//! to the handler that runs next. An [`Orchestrator`] consumes events from its
//! topic, runs the matching handler, records the event in the saga's log and
//! publishes the handler's reply. The loop ends when a terminal transition
//! emits `(MARK_SAGA_COMPLETE, SAGA_COMPLETED)` and the built-in finalizer
//! marks the saga `COMPLETED`.
//!
//! Delivery is at-least-once. A failed handler leaves the saga untouched and
//! the channel redelivers the event after a backoff; there are no
//! compensating steps.

pub mod channel;
pub mod error;
pub mod event;
pub mod graph;
pub mod maintenance;
pub mod orchestrator;
pub mod results_export;
pub mod retry;
pub mod service;
pub mod services;
pub mod worker;

pub use channel::{
    Delivery, DeliveryStream, InMemoryChannel, MessageChannel, PostgresChannel,
    PostgresChannelConfig,
};
pub use error::{ChannelError, GraphError, Result, SagaError};
pub use event::{Event, SYSTEM_USER};
pub use graph::{StepContext, StepGraph, StepGraphBuilder, StepHandler, TransitionKey};
pub use maintenance::{MaintenanceConfig, PurgeReport, ReplayReport, SagaMaintenance};
pub use orchestrator::{Dispatch, IgnoreReason, Orchestrator};
pub use retry::{RetryPolicy, retry_with_backoff, with_timeout};
pub use service::SagaService;
pub use services::{
    DownstreamNotifier, FileGenerator, GeneratedFile, InMemoryDownstreamNotifier,
    InMemoryFileGenerator,
};
pub use worker::SagaWorker;
