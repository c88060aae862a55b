//! API error types
//!
//! Every engine error kind maps to one HTTP status and one stable numeric
//! code. Processor failures keep the processor's own code in `msg`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use custodia_types::{ErrorKind, EscrowError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// API result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed JSON, path or query
    #[error("Malformed request: {0}")]
    BadRequest(String),

    /// Field-level validation failures
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Anything the escrow engine reported
    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

impl ApiError {
    /// Engine error classification this error falls under
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) | Self::InvalidParameter(_) => ErrorKind::Validation,
            Self::Escrow(err) => err.kind(),
        }
    }

    /// Stable numeric error code
    pub fn error_code(&self) -> i32 {
        match self {
            // 1xxx - Request issues
            Self::BadRequest(_) => -1101,
            Self::InvalidParameter(_) => -1102,
            Self::Escrow(err) => match err {
                EscrowError::Validation { .. } => -1100,
                // 2xxx - Lifecycle issues
                EscrowError::InvalidStateTransition { .. } => -2001,
                EscrowError::ConcurrencyConflict { .. } => -2002,
                // 3xxx - Lookup issues
                EscrowError::NotFound { .. } => -3001,
                // 4xxx - Processor issues
                EscrowError::Processor(e) if e.retryable => -4002,
                EscrowError::Processor(_) => -4001,
                // 5xxx - Internal issues
                EscrowError::Storage { .. } => -5001,
            },
        }
    }

    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::InvalidParameter(_) => StatusCode::BAD_REQUEST,
            Self::Escrow(err) => match err {
                EscrowError::Validation { .. } => StatusCode::BAD_REQUEST,
                EscrowError::NotFound { .. } => StatusCode::NOT_FOUND,
                EscrowError::InvalidStateTransition { .. }
                | EscrowError::ConcurrencyConflict { .. } => StatusCode::CONFLICT,
                EscrowError::Processor(e) if e.retryable => StatusCode::SERVICE_UNAVAILABLE,
                EscrowError::Processor(_) => StatusCode::BAD_GATEWAY,
                EscrowError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

/// API error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: i32,
    /// Human-readable error message
    pub msg: String,
    pub kind: ErrorKind,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        Self {
            code: err.error_code(),
            msg: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = err
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| {
                    format!(
                        "{}: {}",
                        field,
                        e.message.as_ref().map(|m| m.as_ref()).unwrap_or("invalid")
                    )
                })
            })
            .collect();
        messages.sort();
        Self::InvalidParameter(messages.join(", "))
    }
}
