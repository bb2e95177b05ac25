use axum::{extract::State, response::Json, routing::post, Router};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    entities::commerce::DiscountType, errors::ServiceError, ApiResponse, AppState,
};

pub fn coupons_routes() -> Router<AppState> {
    Router::new().route("/validate", post(validate_coupon))
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    /// Cart subtotal; enables the minimum-order check and the discount amount
    pub subtotal: Option<Decimal>,
}

/// Either a discount descriptor or the reason the code was refused
#[derive(Debug, Serialize, ToSchema)]
pub struct CouponValidationResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_type: Option<DiscountType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Check a coupon code without redeeming it
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    summary = "Validate coupon",
    description = "Read-only check of a coupon code. Never changes the code's usage count.",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Validation outcome; `valid` is false with a `reason` when refused", body = ApiResponse<CouponValidationResponse>),
        (status = 400, description = "Malformed request", body = crate::errors::ErrorResponse),
    ),
    tag = "coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    Json(request): Json<ValidateCouponRequest>,
) -> Result<Json<ApiResponse<CouponValidationResponse>>, ServiceError> {
    request.validate()?;

    if matches!(request.subtotal, Some(subtotal) if subtotal < Decimal::ZERO) {
        return Err(ServiceError::ValidationError(
            "subtotal must not be negative".to_string(),
        ));
    }

    let outcome = state
        .services
        .coupons
        .evaluate(&request.code, request.subtotal, Utc::now())
        .await?;

    let response = match outcome {
        Ok(applied) => CouponValidationResponse {
            valid: true,
            code: Some(applied.code),
            discount_type: Some(applied.discount_type),
            discount_value: Some(applied.discount_value),
            discount_amount: request.subtotal.map(|_| applied.discount_amount),
            reason: None,
        },
        Err(reason) => CouponValidationResponse {
            valid: false,
            code: None,
            discount_type: None,
            discount_value: None,
            discount_amount: None,
            reason: Some(reason.to_string()),
        },
    };

    Ok(Json(ApiResponse::success(response)))
}
