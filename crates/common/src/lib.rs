//! Shared identifiers and event names used by the saga crates.

pub mod names;
pub mod types;

pub use names::{EventOutcome, EventType, InvalidName};
pub use types::SagaId;
