//! Liveness endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga::MessageChannel;
use saga_store::SagaStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub saga: String,
    pub topic: String,
}

/// GET /health: the process is up and serving its workflow.
pub async fn check<S, C>(State(state): State<Arc<AppState<S, C>>>) -> Json<HealthResponse>
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    Json(HealthResponse {
        status: "ok",
        saga: state.orchestrator.name().to_string(),
        topic: state.orchestrator.topic().to_string(),
    })
}
