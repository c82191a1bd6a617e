//! HTTP error mapping
//!
//! Every handler error becomes a JSON body `{"error": "..."}` with a status
//! derived from the core error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use relay_core::{GenerationError, StopSignalError, StoreError};

/// Errors returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    /// 400
    #[error("{0}")]
    BadRequest(String),

    /// 404
    #[error("{0}")]
    NotFound(String),

    /// 409
    #[error("{0}")]
    Conflict(String),

    /// 500
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::NotFound(_) => Self::NotFound(e.to_string()),
            GenerationError::AlreadyActive(_) => Self::Conflict(e.to_string()),
            GenerationError::InvalidRequest(_) => Self::BadRequest(e.to_string()),
            GenerationError::Store(store) => store.into(),
            GenerationError::TaskFailed(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::MessageNotFound(_) | StoreError::ThreadNotFound(_) => {
                Self::NotFound(e.to_string())
            }
            StoreError::Unavailable(_) => Self::Internal(e.to_string()),
        }
    }
}

impl From<StopSignalError> for ApiError {
    fn from(e: StopSignalError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
