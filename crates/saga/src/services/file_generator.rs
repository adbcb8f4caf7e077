//! Results file generator trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// A generated results file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub file_name: String,
    pub row_count: u64,
}

/// Produces the results file of an assessment session.
#[async_trait]
pub trait FileGenerator: Send + Sync {
    /// Generates the file for a session and records it against the saga.
    async fn generate(
        &self,
        saga_id: SagaId,
        session_id: &str,
        assessment_code: &str,
    ) -> Result<GeneratedFile, SagaError>;

    /// Returns the file already generated for a saga, if any.
    async fn find_by_saga(&self, saga_id: SagaId) -> Result<Option<GeneratedFile>, SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryFileGeneratorState {
    files: HashMap<SagaId, GeneratedFile>,
    generate_calls: usize,
    fail_on_generate: bool,
}

/// In-memory file generator for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileGenerator {
    state: Arc<RwLock<InMemoryFileGeneratorState>>,
}

impl InMemoryFileGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryFileGeneratorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryFileGeneratorState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the generator to fail every generate call.
    pub fn set_fail_on_generate(&self, fail: bool) {
        self.write().fail_on_generate = fail;
    }

    /// Number of times `generate` actually ran.
    pub fn generate_calls(&self) -> usize {
        self.read().generate_calls
    }

    pub fn file_count(&self) -> usize {
        self.read().files.len()
    }
}

#[async_trait]
impl FileGenerator for InMemoryFileGenerator {
    async fn generate(
        &self,
        saga_id: SagaId,
        session_id: &str,
        assessment_code: &str,
    ) -> Result<GeneratedFile, SagaError> {
        let mut state = self.write();

        if state.fail_on_generate {
            return Err(SagaError::FileGeneration(
                "results storage unavailable".to_string(),
            ));
        }

        state.generate_calls += 1;
        let file = GeneratedFile {
            file_name: format!("{assessment_code}_{session_id}.csv"),
            row_count: 1,
        };
        state.files.insert(saga_id, file.clone());
        Ok(file)
    }

    async fn find_by_saga(&self, saga_id: SagaId) -> Result<Option<GeneratedFile>, SagaError> {
        Ok(self.read().files.get(&saga_id).cloned())
    }
}
