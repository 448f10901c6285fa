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

impl From<fleetd_core::Error> for ApiError {
    fn from(err: fleetd_core::Error) -> Self {
        match err.root_cause() {
            fleetd_core::Error::NotFound(_) => ApiError::NotFound(err.to_string()),
            fleetd_core::Error::InvalidInput(_) | fleetd_core::Error::Unsupported(_) => {
                ApiError::BadRequest(err.to_string())
            }
            fleetd_core::Error::Conflict(_) => ApiError::Conflict(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<fleetd_db::DbError> for ApiError {
    fn from(err: fleetd_db::DbError) -> Self {
        fleetd_core::Error::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_root_cause() {
        let err = fleetd_core::Error::NotFound("host h1".into()).context("loading host");
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let err = fleetd_core::Error::Conflict("job a is already queued".into());
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let err = fleetd_core::Error::Persistence("connection reset".into());
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
