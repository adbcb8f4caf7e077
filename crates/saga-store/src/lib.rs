pub mod error;
pub mod event_state;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod store;

pub use common::{EventOutcome, EventType, SagaId};
pub use error::{Result, StoreError};
pub use event_state::{NewEventState, SagaEventState};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use query::SagaQuery;
pub use record::{CorrelationIds, NewSaga, SagaRecord, SagaStatus};
pub use store::{Advanced, SagaAdvance, SagaStore, SagaStoreExt};
