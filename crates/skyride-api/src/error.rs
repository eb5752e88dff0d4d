// API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use skyride_core::CachedResponse;
use skyride_engine::{ErrorClass, WorkflowError};

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Body of a booking response, as cached on the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "OK")]
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    /// Terminal outcome already stored on the key; replays return the same
    Cached(CachedResponse),
    Status(StatusCode, String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Status(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Status(StatusCode::UNAUTHORIZED, message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Status(StatusCode::INTERNAL_SERVER_ERROR, message.into())
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        if let Some(response) = err.cached_response() {
            return Self::Cached(response.clone());
        }

        let status = match err.class() {
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            ErrorClass::ServiceUnavailable | ErrorClass::Retryable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorClass::BadRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match status {
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %err, "booking failed");
                "internal server error".to_string()
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                tracing::warn!(error = %err, "booking failed, retryable");
                "temporarily unavailable, retry with the same idempotency key".to_string()
            }
            _ => err.to_string(),
        };

        Self::Status(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Cached(response) => cached_into_response(response),
            Self::Status(status, message) => {
                (status, Json(ErrorResponse::new(message))).into_response()
            }
        }
    }
}

/// Render a cached `(status, body)` pair
pub fn cached_into_response(response: CachedResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = MessageResponse {
        message: response.body.message,
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: WorkflowError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_of(WorkflowError::ParamsMismatch), StatusCode::CONFLICT);
        assert_eq!(status_of(WorkflowError::RequestInProgress), StatusCode::CONFLICT);
        assert_eq!(
            status_of(WorkflowError::InvalidRequest("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(WorkflowError::UnknownRecoveryPoint("X".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(WorkflowError::Gateway(skyride_core::PaymentError::transport(
                "reset"
            ))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_terminal_payment_error_uses_cached_response() {
        let err = WorkflowError::PaymentDeclined {
            response: CachedResponse::payment_required("payment provider error"),
        };
        assert_eq!(status_of(err), StatusCode::PAYMENT_REQUIRED);
    }
}
