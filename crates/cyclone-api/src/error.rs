//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// A cloud backend could not serve the request.
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<cyclone_core::Error> for ApiError {
    fn from(err: cyclone_core::Error) -> Self {
        use cyclone_core::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) | Error::Config(msg) => ApiError::BadRequest(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::InsufficientResource
            | Error::AllCloudsFailed(_)
            | Error::Provision(_)
            | Error::Timeout(_) => ApiError::Unavailable(err.to_string()),
            Error::Internal(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<cyclone_db::DbError> for ApiError {
    fn from(err: cyclone_db::DbError) -> Self {
        match err {
            cyclone_db::DbError::NotFound(msg) => ApiError::NotFound(msg),
            cyclone_db::DbError::Duplicate(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}
