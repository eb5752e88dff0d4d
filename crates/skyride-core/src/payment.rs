//! Payment gateway port
//!
//! The workflow charges the rider exactly once per key. The gateway is told
//! a token derived from the key, so a repeated call after a crash is
//! deduplicated on the gateway's side as well.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Context;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    /// Amount in the smallest currency unit
    pub amount: i64,
    pub currency: String,
    /// Customer reference at the gateway
    pub customer: String,
    /// Gateway-side idempotency token
    pub idempotency_token: String,
    pub description: String,
}

/// A successful charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
}

/// Failure of a charge attempt.
///
/// Whether a failure is terminal decides what the workflow does with the
/// key: terminal failures finish it with a cached error response, transient
/// ones leave it resumable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    /// The instrument itself was rejected
    #[error("card declined: {message}")]
    CardDeclined {
        code: Option<String>,
        message: String,
    },

    /// The gateway rejected the request itself, such as an unknown customer
    #[error("payment provider error: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    /// The gateway was unreachable, unintelligible or temporarily failing
    #[error("payment provider unreachable: {0}")]
    Transport(String),
}

impl PaymentError {
    pub fn card_declined(message: impl Into<String>) -> Self {
        Self::CardDeclined {
            code: None,
            message: message.into(),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            status: None,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Terminal failures must not be retried with the same key
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, ctx: &Context, request: ChargeRequest) -> Result<Charge, PaymentError>;
}
