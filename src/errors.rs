use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for request-level errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::SessionNotActive { .. } => StatusCode::CONFLICT,
            UploadError::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            UploadError::UploadIncomplete { .. } | UploadError::ChecksumMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            UploadError::Sqlx(_) | UploadError::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        // storage failures are retryable; keep backend detail out of the body
        let message = match &err {
            UploadError::Sqlx(inner) => {
                tracing::error!(error = %inner, "metadata store failure");
                "metadata store unavailable".to_string()
            }
            UploadError::Io(inner) => {
                tracing::error!(error = %inner, "storage failure");
                "storage unavailable".to_string()
            }
            other => other.to_string(),
        };

        AppError::new(status, message)
    }
}
