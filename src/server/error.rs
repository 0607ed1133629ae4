//! Maps [`IntakeError`] onto the HTTP status codes in the error handling
//! contract. Internal errors are logged with detail and never leaked to the
//! client body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::kernel::IntakeError;

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::Validation(msg) => ApiError {
                status: StatusCode::BAD_REQUEST,
                message: msg,
            },
            IntakeError::NotFound => ApiError {
                status: StatusCode::NOT_FOUND,
                message: "job not found".to_string(),
            },
            IntakeError::Conflict => ApiError {
                status: StatusCode::CONFLICT,
                message: "job is already in a terminal state".to_string(),
            },
            IntakeError::QueueFull => ApiError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "job queue is full, try again later".to_string(),
            },
            IntakeError::Store(e) => {
                tracing::error!(error = %e, "store operation failed");
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}
