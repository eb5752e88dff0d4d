// Stripe payment gateway
//
// Creates charges through the Stripe REST API. The secret key is injected
// through StripeConfig; nothing is read from process-wide state.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use skyride_core::{Charge, ChargeRequest, Context, PaymentError, PaymentGateway};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

/// Configuration for the Stripe gateway
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Base URL, without trailing slash
    pub api_base: String,
    /// Per-call timeout
    pub timeout: Duration,
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            api_base: STRIPE_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Returns None if `STRIPE_KEY` is not set.
    pub fn from_env() -> Option<Self> {
        let secret_key = env::var("STRIPE_KEY").ok().filter(|k| !k.is_empty())?;

        let api_base = env::var("STRIPE_API_BASE")
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| STRIPE_API_BASE.to_string());

        Some(Self {
            api_base,
            ..Self::new(secret_key)
        })
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct StripeCharge {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type")]
    kind: String,
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Payment gateway backed by Stripe charges
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Result<Self, PaymentError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn charges_url(&self) -> String {
        format!("{}/v1/charges", self.config.api_base)
    }
}

/// Error types that say nothing about the charge itself; the same request
/// may succeed later.
const TRANSIENT_ERROR_TYPES: &[&str] = &[
    "api_error",
    "api_connection_error",
    "authentication_error",
    "idempotency_error",
    "rate_limit_error",
];

fn is_transient(status: reqwest::StatusCode, kind: &str) -> bool {
    status.is_server_error()
        || matches!(status.as_u16(), 401 | 409 | 429)
        || TRANSIENT_ERROR_TYPES.contains(&kind)
}

/// Map a Stripe error response to a payment error.
///
/// Only a declined card or a rejected request is terminal. Outages, rate
/// limits and idempotency races leave the charge retryable.
fn classify(status: reqwest::StatusCode, body: &str) -> PaymentError {
    match serde_json::from_str::<StripeErrorEnvelope>(body) {
        Ok(envelope) if envelope.error.kind == "card_error" => PaymentError::CardDeclined {
            code: envelope.error.code,
            message: envelope.error.message,
        },
        Ok(envelope) if is_transient(status, &envelope.error.kind) => PaymentError::transport(
            format!(
                "payment provider returned {status} ({}): {}",
                envelope.error.kind, envelope.error.message
            ),
        ),
        Ok(envelope) => PaymentError::Api {
            status: Some(status.as_u16()),
            message: format!("{}: {}", envelope.error.kind, envelope.error.message),
        },
        Err(_) => PaymentError::transport(format!(
            "unexpected response from payment provider with status {status}"
        )),
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip_all, fields(customer = %request.customer, token = %request.idempotency_token))]
    async fn charge(&self, ctx: &Context, request: ChargeRequest) -> Result<Charge, PaymentError> {
        let form = [
            ("amount", request.amount.to_string()),
            ("currency", request.currency),
            ("customer", request.customer),
            ("description", request.description),
        ];

        let send = self
            .client
            .post(self.charges_url())
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", &request.idempotency_token)
            .form(&form)
            .send();

        let response = ctx
            .run(send)
            .await
            .map_err(|e| PaymentError::transport(e.to_string()))?
            .map_err(|e| PaymentError::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify(status, &body));
        }

        let charge: StripeCharge = serde_json::from_str(&body)
            .map_err(|e| PaymentError::transport(format!("invalid charge response: {e}")))?;
        debug!(charge_id = %charge.id, "stripe charge created");
        Ok(Charge { id: charge.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_card_error_is_declined() {
        let body = r#"{"error":{"type":"card_error","code":"card_declined","message":"Your card was declined."}}"#;
        assert_eq!(
            classify(StatusCode::PAYMENT_REQUIRED, body),
            PaymentError::CardDeclined {
                code: Some("card_declined".to_string()),
                message: "Your card was declined.".to_string(),
            }
        );
    }

    #[test]
    fn test_other_stripe_error_is_api_error() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"No such customer"}}"#;
        let err = classify(StatusCode::BAD_REQUEST, body);
        assert!(matches!(err, PaymentError::Api { status: Some(400), .. }));
        assert!(err.is_terminal());
    }

    #[test]
    fn test_outages_and_races_are_transient() {
        let cases = [
            (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            (StatusCode::CONFLICT, "idempotency_error"),
            (StatusCode::BAD_REQUEST, "idempotency_error"),
            (StatusCode::UNAUTHORIZED, "authentication_error"),
            (StatusCode::SERVICE_UNAVAILABLE, "invalid_request_error"),
        ];
        for (status, kind) in cases {
            let body = format!(r#"{{"error":{{"type":"{kind}","message":"try later"}}}}"#);
            let err = classify(status, &body);
            assert!(matches!(err, PaymentError::Transport(_)), "{status} {kind}: {err:?}");
            assert!(!err.is_terminal());
        }
    }

    #[test]
    fn test_unparseable_error_is_transient() {
        let err = classify(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(!err.is_terminal());
    }
}
