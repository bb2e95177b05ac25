//! HTTP gateway client against a mock gateway.

use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use storefront_api::{
    circuit_breaker::CircuitBreakerConfig,
    errors::ServiceError,
    services::payment_gateway::{GatewayConfig, HttpPaymentGateway, PaymentGateway},
};
use wiremock::{
    matchers::{body_json, header, header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn config(base_url: String, failure_threshold: u32) -> GatewayConfig {
    GatewayConfig {
        base_url,
        key_id: "rzp_test_key".to_string(),
        key_secret: "rzp_test_secret".to_string(),
        timeout: Duration::from_secs(5),
        breaker: CircuitBreakerConfig {
            failure_threshold,
            timeout: Duration::from_secs(60),
            success_threshold: 1,
        },
    }
}

#[tokio::test]
async fn creates_charge_with_idempotency_key_and_basic_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .and(header("Idempotency-Key", "checkout-123"))
        .and(header_exists("authorization"))
        .and(body_json(json!({
            "amount": 180000,
            "currency": "INR",
            "receipt": "checkout-123"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "order_gw_1",
            "amount": 180000,
            "currency": "INR",
            "status": "created"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(config(server.uri(), 5)).unwrap();
    let charge = gateway
        .create_charge(180_000, "INR", "checkout-123")
        .await
        .expect("charge created");

    assert_eq!(charge.gateway_order_id, "order_gw_1");
    assert_eq!(charge.amount, 180_000);
    assert_eq!(charge.currency, "INR");
}

#[tokio::test]
async fn gateway_error_is_payment_initialization_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(config(server.uri(), 5)).unwrap();
    let err = gateway
        .create_charge(5_000, "INR", "checkout-500")
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::PaymentInitializationFailed(_));
    assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unparseable_response_is_payment_initialization_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(config(server.uri(), 5)).unwrap();
    assert_matches!(
        gateway.create_charge(5_000, "INR", "checkout-html").await,
        Err(ServiceError::PaymentInitializationFailed(_))
    );
}

#[tokio::test]
async fn open_breaker_stops_calling_the_gateway() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/orders"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let gateway = HttpPaymentGateway::new(config(server.uri(), 2)).unwrap();
    for key in ["a", "b", "c", "d"] {
        assert_matches!(
            gateway.create_charge(5_000, "INR", key).await,
            Err(ServiceError::PaymentInitializationFailed(_))
        );
    }
    // MockServer verifies `expect(2)` on drop
}
