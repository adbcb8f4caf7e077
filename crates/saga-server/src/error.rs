//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use saga_store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Saga(#[from] SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::SagaNotFound(_) | SagaError::Store(StoreError::SagaNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        SagaError::AlreadyActive { .. }
        | SagaError::Store(StoreError::InvalidStatusTransition { .. })
        | SagaError::Store(StoreError::StateConflict { .. }) => StatusCode::CONFLICT,
        SagaError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            tracing::error!(error = %err, "internal server error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}
