//! Saga start, inspection and administrative endpoints.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::results_export::{ResultsExportPayload, SESSION_KEY};
use saga::{MessageChannel, SagaError};
use saga_store::{SagaEventState, SagaRecord, SagaStore};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// User recorded when a request does not name one.
const ANONYMOUS_USER: &str = "anonymous";

// -- Request types --

#[derive(Deserialize)]
pub struct StartExportRequest {
    pub session_id: String,
    pub assessment_code: String,
    pub user: Option<String>,
}

#[derive(Deserialize)]
pub struct FailSagaRequest {
    pub user: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub saga_name: String,
    pub saga_state: Option<String>,
    pub status: String,
    pub retry_count: i32,
    pub correlation_ids: serde_json::Map<String, serde_json::Value>,
    pub create_user: String,
    pub create_date: DateTime<Utc>,
    pub update_user: String,
    pub update_date: DateTime<Utc>,
}

impl From<SagaRecord> for SagaResponse {
    fn from(saga: SagaRecord) -> Self {
        Self {
            saga_id: saga.saga_id.to_string(),
            saga_name: saga.saga_name,
            saga_state: saga.saga_state.map(|s| s.to_string()),
            status: saga.status.as_str().to_string(),
            retry_count: saga.retry_count,
            correlation_ids: saga
                .correlation_ids
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
                .collect(),
            create_user: saga.create_user,
            create_date: saga.create_date,
            update_user: saga.update_user,
            update_date: saga.update_date,
        }
    }
}

#[derive(Serialize)]
pub struct EventStateResponse {
    pub step_number: i32,
    pub event_type: String,
    pub event_outcome: String,
    pub payload: String,
    pub create_date: DateTime<Utc>,
}

impl From<SagaEventState> for EventStateResponse {
    fn from(row: SagaEventState) -> Self {
        Self {
            step_number: row.saga_step_number,
            event_type: row.saga_event_state.to_string(),
            event_outcome: row.saga_event_outcome.to_string(),
            payload: row.payload,
            create_date: row.create_date,
        }
    }
}

// -- Handlers --

/// POST /results-exports: start an export unless one is running for the session.
#[tracing::instrument(skip(state, req), fields(session_id = %req.session_id))]
pub async fn start_export<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Json(req): Json<StartExportRequest>,
) -> Result<(StatusCode, Json<SagaResponse>), ApiError>
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    if req.session_id.trim().is_empty() || req.assessment_code.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "session_id and assessment_code are required".to_string(),
        ));
    }

    let user = req.user.as_deref().unwrap_or(ANONYMOUS_USER);
    let payload = ResultsExportPayload::new(req.session_id.as_str(), req.assessment_code.as_str());

    let result = state
        .orchestrator
        .start_if_absent(&payload, user, SESSION_KEY, &req.session_id)
        .await;

    let outcome = match &result {
        Ok(_) => "started",
        Err(SagaError::AlreadyActive { .. }) => "already_active",
        Err(_) => "error",
    };
    metrics::counter!("saga_start_requests_total", "outcome" => outcome).increment(1);

    Ok((StatusCode::ACCEPTED, Json(result?.into())))
}

/// GET /sagas/{id}: load a saga.
#[tracing::instrument(skip(state))]
pub async fn get<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError>
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let saga = state.orchestrator.service().find_saga(saga_id).await?;
    Ok(Json(saga.into()))
}

/// GET /sagas/{id}/events: the saga's event log in step order.
#[tracing::instrument(skip(state))]
pub async fn events<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventStateResponse>>, ApiError>
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let service = state.orchestrator.service();

    // Distinguish an unknown saga from one with an empty log.
    service.find_saga(saga_id).await?;
    let rows = service.event_states(saga_id).await?;

    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// POST /sagas/{id}/fail: move an `IN_PROGRESS` saga to `FAILED`.
///
/// The body is optional; `{"user": "..."}` names the operator.
#[tracing::instrument(skip(state, body))]
pub async fn fail<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SagaResponse>, ApiError>
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let user = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<FailSagaRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?
            .user
    }
    .unwrap_or_else(|| ANONYMOUS_USER.to_string());

    let saga = state.orchestrator.service().mark_failed(saga_id, &user).await?;
    Ok(Json(saga.into()))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    uuid::Uuid::parse_str(id)
        .map(SagaId::from_uuid)
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
