//! Stripe gateway against a mocked charges endpoint

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use skyride_core::{ChargeRequest, Context, PaymentError, PaymentGateway};
use skyride_engine::{StripeConfig, StripeGateway};

fn gateway(server: &MockServer) -> StripeGateway {
    StripeGateway::new(StripeConfig::new("sk_test_123").with_api_base(server.uri())).unwrap()
}

fn request() -> ChargeRequest {
    ChargeRequest {
        amount: 2000,
        currency: "usd".to_string(),
        customer: "cus_42".to_string(),
        idempotency_token: "skyride-0190".to_string(),
        description: "Charge for ride 0190".to_string(),
    }
}

#[test_log::test(tokio::test)]
async fn test_charge_posts_form_with_idempotency_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(header("idempotency-key", "skyride-0190"))
        .and(body_string_contains("amount=2000"))
        .and(body_string_contains("customer=cus_42"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "ch_mock_1", "object": "charge"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let charge = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap();

    assert_eq!(charge.id, "ch_mock_1");
}

#[tokio::test]
async fn test_card_error_is_declined() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({"error": {
            "type": "card_error",
            "code": "card_declined",
            "message": "Your card was declined."
        }})))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PaymentError::CardDeclined {
            code: Some("card_declined".to_string()),
            message: "Your card was declined.".to_string(),
        }
    );
}

#[tokio::test]
async fn test_invalid_request_is_api_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": {
            "type": "invalid_request_error",
            "message": "No such customer: cus_42"
        }})))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::Api { status: Some(400), .. }));
    assert!(err.is_terminal());
}

#[tokio::test]
async fn test_provider_api_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": {
            "type": "api_error",
            "message": "An unknown error occurred"
        }})))
        .expect(1)
        .mount(&server)
        .await;

    let err = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::Transport(_)), "{err:?}");
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn test_rate_limit_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"error": {
            "type": "invalid_request_error",
            "code": "rate_limit",
            "message": "Too many requests hit the API too quickly."
        }})))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::Transport(_)), "{err:?}");
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn test_concurrent_use_of_token_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": {
            "type": "idempotency_error",
            "message": "There is currently another in-progress request using this Idempotent Key."
        }})))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap_err();

    assert!(!err.is_terminal());
}

#[tokio::test]
async fn test_gateway_outage_is_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;

    let err = gateway(&server)
        .charge(&Context::background(), request())
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::Transport(_)));
    assert!(!err.is_terminal());
}

#[tokio::test]
async fn test_slow_gateway_is_cut_off_by_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/charges"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "ch_late"}))
                .set_delay(std::time::Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let ctx = Context::background().with_timeout(std::time::Duration::from_millis(200));
    let err = gateway(&server).charge(&ctx, request()).await.unwrap_err();

    assert!(matches!(err, PaymentError::Transport(_)));
}
