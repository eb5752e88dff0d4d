// Workflow errors and their response classes

use skyride_core::{CachedResponse, ContextError, PaymentError};
use skyride_storage::StoreError;

/// How a workflow error should be presented to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Key reused with other parameters, or another attempt holds the lock
    Conflict,
    /// Payment instrument rejected
    PaymentRequired,
    /// Payment provider refused the charge for a non-card reason
    ServiceUnavailable,
    /// Request can never succeed as sent
    BadRequest,
    /// Transient failure; the same request may be retried later
    Retryable,
    /// Stored state is corrupt or something unexpected broke
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The key was first used with a different request
    #[error("there is a problem with the request params")]
    ParamsMismatch,

    /// Another attempt holds a live lock on the key
    #[error("a request with the same idempotency key is already in progress")]
    RequestInProgress,

    /// Another attempt took the key over while this one was running.
    /// Nothing was written; a retry replays or waits for that attempt.
    #[error("idempotency key was taken over by another request")]
    LockLost,

    /// The stored recovery point cannot be interpreted
    #[error("unknown recovery point: {0}")]
    UnknownRecoveryPoint(String),

    /// Terminal: the card was declined. The key is finished with `response`.
    #[error("payment declined: {}", .response.body.message)]
    PaymentDeclined { response: CachedResponse },

    /// Terminal: the provider refused the charge. The key is finished with `response`.
    #[error("payment provider error: {}", .response.body.message)]
    PaymentUnavailable { response: CachedResponse },

    /// Transient gateway failure; the key stays resumable
    #[error(transparent)]
    Gateway(PaymentError),

    /// Invalid request payload
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for WorkflowError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownRecoveryPoint(point) => Self::UnknownRecoveryPoint(point.0),
            StoreError::Context(cause) => Self::Context(cause),
            StoreError::Stale { .. } => Self::LockLost,
            other => Self::Store(other),
        }
    }
}

impl WorkflowError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ParamsMismatch | Self::RequestInProgress | Self::LockLost => {
                ErrorClass::Conflict
            }
            Self::PaymentDeclined { .. } => ErrorClass::PaymentRequired,
            Self::PaymentUnavailable { .. } => ErrorClass::ServiceUnavailable,
            Self::InvalidRequest(_) => ErrorClass::BadRequest,
            Self::Gateway(_) | Self::Context(_) => ErrorClass::Retryable,
            Self::Store(e) if e.is_retryable() => ErrorClass::Retryable,
            Self::Store(_) | Self::UnknownRecoveryPoint(_) | Self::Serialization(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// Whether sending the same request again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Retryable | ErrorClass::Conflict)
            && !matches!(self, Self::ParamsMismatch)
    }

    /// The cached response of a terminal payment failure
    pub fn cached_response(&self) -> Option<&CachedResponse> {
        match self {
            Self::PaymentDeclined { response } | Self::PaymentUnavailable { response } => {
                Some(response)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyride_core::UnknownRecoveryPoint;

    #[test]
    fn test_store_errors_are_unwrapped() {
        let err = WorkflowError::from(StoreError::UnknownRecoveryPoint(UnknownRecoveryPoint(
            "REFUNDED".to_string(),
        )));
        assert!(matches!(&err, WorkflowError::UnknownRecoveryPoint(p) if p == "REFUNDED"));
        assert_eq!(err.class(), ErrorClass::Internal);
        assert!(!err.is_retryable());

        let err = WorkflowError::from(StoreError::stale("idempotency key", 1));
        assert!(matches!(err, WorkflowError::LockLost));
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(err.is_retryable());

        let err = WorkflowError::from(StoreError::Context(ContextError::Cancelled));
        assert!(matches!(err, WorkflowError::Context(ContextError::Cancelled)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classes() {
        assert_eq!(WorkflowError::ParamsMismatch.class(), ErrorClass::Conflict);
        assert!(!WorkflowError::ParamsMismatch.is_retryable());
        assert!(WorkflowError::RequestInProgress.is_retryable());

        let declined = WorkflowError::PaymentDeclined {
            response: CachedResponse::payment_required("card declined"),
        };
        assert_eq!(declined.class(), ErrorClass::PaymentRequired);
        assert_eq!(declined.cached_response().map(|r| r.status), Some(402));
        assert!(!declined.is_retryable());

        let transient = WorkflowError::Gateway(PaymentError::transport("timeout"));
        assert_eq!(transient.class(), ErrorClass::Retryable);

        let conflict = WorkflowError::from(StoreError::Conflict("40001".to_string()));
        assert_eq!(conflict.class(), ErrorClass::Retryable);
        let broken = WorkflowError::from(StoreError::not_found("ride", 1));
        assert_eq!(broken.class(), ErrorClass::Internal);
    }
}
