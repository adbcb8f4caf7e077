//! Downstream notification trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::SagaId;

use crate::error::SagaError;

/// Tells a downstream system that a results file is ready.
#[async_trait]
pub trait DownstreamNotifier: Send + Sync {
    async fn notify(&self, saga_id: SagaId, file_name: &str) -> Result<(), SagaError>;

    /// Returns true if the downstream system was already told about this saga.
    async fn was_notified(&self, saga_id: SagaId) -> Result<bool, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryNotifierState {
    notifications: HashMap<SagaId, String>,
    notify_calls: usize,
    fail_on_notify: bool,
}

/// In-memory notifier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDownstreamNotifier {
    state: Arc<RwLock<InMemoryNotifierState>>,
}

impl InMemoryDownstreamNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryNotifierState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryNotifierState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the notifier to fail every notify call.
    pub fn set_fail_on_notify(&self, fail: bool) {
        self.write().fail_on_notify = fail;
    }

    /// Number of notifications actually sent.
    pub fn notify_calls(&self) -> usize {
        self.read().notify_calls
    }

    /// The file name sent for a saga, if any.
    pub fn notified_file(&self, saga_id: SagaId) -> Option<String> {
        self.read().notifications.get(&saga_id).cloned()
    }
}

#[async_trait]
impl DownstreamNotifier for InMemoryDownstreamNotifier {
    async fn notify(&self, saga_id: SagaId, file_name: &str) -> Result<(), SagaError> {
        let mut state = self.write();

        if state.fail_on_notify {
            return Err(SagaError::Notification("downstream unreachable".to_string()));
        }

        state.notify_calls += 1;
        state.notifications.insert(saga_id, file_name.to_string());
        Ok(())
    }

    async fn was_notified(&self, saga_id: SagaId) -> Result<bool, SagaError> {
        Ok(self.read().notifications.contains_key(&saga_id))
    }
}
