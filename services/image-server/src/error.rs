//! Error types for the image service

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use image_storage::{ImageError, ImageErrorKind};

/// Result type for image service handlers
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors reported by the image service
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The storage backend failed
    #[error(transparent)]
    Storage(#[from] ImageError),
}

impl ServiceError {
    /// The storage error kind behind this error.
    pub fn kind(&self) -> ImageErrorKind {
        match self {
            ServiceError::Storage(err) => err.kind(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ImageErrorKind::NotFound => StatusCode::NOT_FOUND,
            ImageErrorKind::Duplicate => StatusCode::CONFLICT,
            ImageErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ImageErrorKind::Connection => StatusCode::SERVICE_UNAVAILABLE,
            ImageErrorKind::Io | ImageErrorKind::Other => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code reported to clients
    pub fn error_code(&self) -> &'static str {
        match self.kind() {
            ImageErrorKind::NotFound => "not_found",
            ImageErrorKind::Duplicate => "duplicate",
            ImageErrorKind::InvalidRequest => "invalid_request",
            ImageErrorKind::Connection => "unavailable",
            ImageErrorKind::Io => "io",
            ImageErrorKind::Other => "internal",
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Storage request failed");
        } else {
            tracing::debug!(error = %self, "Storage request rejected");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                kind: self.error_code(),
                message: self.to_string(),
            },
        };

        (status, axum::Json(body)).into_response()
    }
}
