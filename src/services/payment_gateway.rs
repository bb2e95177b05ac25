/*!
 * # Payment gateway adapter
 *
 * Charges are created remotely before an order row exists; the customer then
 * pays out-of-band and the gateway calls back with a payment id and an
 * HMAC-SHA256 signature over `gateway_order_id|gateway_payment_id`.
 */

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{error, instrument};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError},
    config::AppConfig,
    errors::ServiceError,
};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_DELIMITER: &str = "|";

/// A charge the gateway is ready to collect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCharge {
    pub gateway_order_id: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Creates a remote charge. `idempotency_key` lets the gateway collapse
    /// retried requests for the same checkout.
    async fn create_charge(
        &self,
        amount_minor: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayCharge, ServiceError>;
}

fn signed_payload(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    format!("{gateway_order_id}{SIGNATURE_DELIMITER}{gateway_payment_id}")
}

/// Hex HMAC-SHA256 the gateway attaches to a payment callback.
pub fn sign(gateway_order_id: &str, gateway_payment_id: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(signed_payload(gateway_order_id, gateway_payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a callback signature. Malformed hex is a mismatch.
pub fn verify_signature(
    gateway_order_id: &str,
    gateway_payment_id: &str,
    signature: &str,
    secret: &str,
) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signed_payload(gateway_order_id, gateway_payment_id).as_bytes());
    mac.verify_slice(&provided).is_ok()
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl From<&AppConfig> for GatewayConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            base_url: cfg.gateway_base_url.trim_end_matches('/').to_string(),
            key_id: cfg.gateway_key_id.clone(),
            key_secret: cfg.gateway_key_secret.clone(),
            timeout: cfg.gateway_timeout(),
            breaker: CircuitBreakerConfig {
                failure_threshold: cfg.circuit_breaker_failure_threshold,
                timeout: Duration::from_secs(cfg.circuit_breaker_timeout_secs),
                success_threshold: cfg.circuit_breaker_success_threshold,
            },
        }
    }
}

#[derive(Serialize)]
struct CreateOrderRequest<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Deserialize)]
struct CreateOrderResponse {
    id: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, thiserror::Error)]
enum GatewayCallError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway responded with status {0}")]
    Status(u16),
}

/// REST client for the gateway's order API
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    breaker: CircuitBreaker,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("gateway client: {}", e)))?;

        Ok(Self {
            client,
            breaker: CircuitBreaker::new("payment_gateway", config.breaker.clone()),
            config,
        })
    }

    async fn post_order(
        &self,
        amount_minor: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<CreateOrderResponse, GatewayCallError> {
        let response = self
            .client
            .post(format!("{}/v1/orders", self.config.base_url))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .header("Idempotency-Key", idempotency_key)
            .json(&CreateOrderRequest {
                amount: amount_minor,
                currency,
                receipt: idempotency_key,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(GatewayCallError::Status(response.status().as_u16()));
        }

        Ok(response.json::<CreateOrderResponse>().await?)
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self))]
    async fn create_charge(
        &self,
        amount_minor: i64,
        currency: &str,
        idempotency_key: &str,
    ) -> Result<GatewayCharge, ServiceError> {
        let outcome = self
            .breaker
            .call(self.post_order(amount_minor, currency, idempotency_key))
            .await;

        match outcome {
            Ok(body) => Ok(GatewayCharge {
                gateway_order_id: body.id,
                amount: body.amount,
                currency: body.currency,
            }),
            Err(err) => {
                let reason = match &err {
                    CircuitBreakerError::CircuitOpen => "circuit_open",
                    CircuitBreakerError::Inner(GatewayCallError::Status(_)) => "rejected",
                    CircuitBreakerError::Inner(GatewayCallError::Transport(_)) => "transport",
                };
                metrics::counter!("storefront_gateway_errors", 1, "reason" => reason);
                error!(error = %err, reason, "gateway charge creation failed");
                Err(ServiceError::PaymentInitializationFailed(err.to_string()))
            }
        }
    }
}
