//! Error handling for the gateway.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    /// Internal server error.
    Internal(String),
    /// The connection cannot carry an event stream.
    Unsupported(String),
    /// The broker is not running.
    Unavailable(String),
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    /// Error flag.
    pub error: bool,
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            AppError::Unsupported(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STREAMING_UNSUPPORTED", msg)
            }
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", msg),
        };

        let body = ErrorResponse {
            error: true,
            code: code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

impl From<tidecast_core::Error> for AppError {
    fn from(err: tidecast_core::Error) -> Self {
        match err {
            tidecast_core::Error::Unsupported(_) => AppError::Unsupported(err.to_string()),
            tidecast_core::Error::BrokerStopped => AppError::Unavailable(err.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidecast_core::Capability;

    #[test]
    fn test_capability_error_is_500() {
        let err = AppError::from(tidecast_core::Error::Unsupported(Capability::CloseNotify));
        assert!(matches!(err, AppError::Unsupported(ref msg) if msg == "close notification unsupported"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_stopped_broker_is_503() {
        let err = AppError::from(tidecast_core::Error::BrokerStopped);
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
