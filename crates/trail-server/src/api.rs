//! Shared API error type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use trail_core::ManagerError;

/// Errors returned by the HTTP handlers.
///
/// Every variant renders as `{statusCode, error, message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    UnprocessableEntity(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl ApiError {
    /// The standard not-found error for a trail id.
    pub fn trail_not_found(id: i64) -> Self {
        Self::NotFound(format!("Trail with id {id} not found."))
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        if err.is_validation() {
            return ApiError::UnprocessableEntity(err.to_string());
        }

        tracing::error!(error = %err, "trail storage operation failed");
        ApiError::InternalServerError(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::UnprocessableEntity(msg)
            | ApiError::InternalServerError(msg) => msg,
        };

        let body = Json(serde_json::json!({
            "statusCode": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("Error"),
            "message": message
        }));

        (status, body).into_response()
    }
}
