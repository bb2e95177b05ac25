use axum::{extract::State, response::Json, routing::post, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::order::{OrderStatus, PaymentStatus},
    errors::ServiceError,
    services::fulfillment::PaymentCallback,
    ApiResponse, AppState,
};

pub fn payments_routes() -> Router<AppState> {
    Router::new().route("/verify", post(verify_payment))
}

/// Payment result relayed by the storefront after the gateway checkout
#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct VerifyPaymentRequest {
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 128))]
    pub gateway_order_id: String,
    #[validate(length(min = 1, max = 128))]
    pub gateway_payment_id: String,
    /// Hex HMAC-SHA256 of `gateway_order_id|gateway_payment_id`
    #[validate(length(min = 1, max = 256))]
    pub signature: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentVerificationResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// True when this callback repeated one already applied
    pub already_processed: bool,
}

/// Verify a signed payment callback and settle the order
#[utoipa::path(
    post,
    path = "/api/v1/payments/verify",
    summary = "Verify payment",
    description = "Checks the gateway signature and reconciles stock, coupon usage and order status once. Replays return the settled order.",
    request_body = VerifyPaymentRequest,
    responses(
        (status = 200, description = "Payment applied or already applied", body = ApiResponse<PaymentVerificationResponse>),
        (status = 400, description = "Invalid signature or mismatched order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 500, description = "Failed to process order", body = crate::errors::ErrorResponse),
    ),
    tag = "payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Json(request): Json<VerifyPaymentRequest>,
) -> Result<Json<ApiResponse<PaymentVerificationResponse>>, ServiceError> {
    request.validate()?;

    let outcome = state
        .services
        .fulfillment
        .handle_callback(PaymentCallback {
            order_id: request.order_id,
            gateway_order_id: request.gateway_order_id,
            gateway_payment_id: request.gateway_payment_id,
            signature: request.signature,
        })
        .await?;

    Ok(Json(ApiResponse::success(PaymentVerificationResponse {
        order_id: outcome.order.id,
        order_number: outcome.order.order_number,
        status: outcome.order.status,
        payment_status: outcome.order.payment_status,
        already_processed: outcome.replayed,
    })))
}
