//! HTTP-facing error type and status mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use pagerelay::broker::DISPATCH_FAILURE;
use pagerelay::{CallError, RelayError};

/// Errors returned by REST handlers, rendered as `{"error": "..."}`.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotConnected(String),

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotConnected(_) => StatusCode::NOT_FOUND,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<CallError> for ApiError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::WorkerUnavailable(_) => ApiError::NotConnected("Client not connected".into()),
            CallError::Timeout(_) => ApiError::Timeout(e.to_string()),
            CallError::WorkerReportedError(ref msg) if msg == DISPATCH_FAILURE => {
                ApiError::Internal(msg.clone())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::NoTargets | RelayError::InvalidInput(_) => ApiError::BadRequest(e.to_string()),
            RelayError::Call(call) => call.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("Request failed: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
