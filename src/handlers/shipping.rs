use axum::{extract::State, response::Json, routing::get, Router};

use crate::{errors::ServiceError, services::shipping::ShippingOptions, ApiResponse, AppState};

pub fn shipping_routes() -> Router<AppState> {
    Router::new().route("/options", get(shipping_options))
}

#[utoipa::path(
    get,
    path = "/api/v1/shipping/options",
    summary = "Shipping options",
    description = "Prices, labels and delivery estimates for each shipping method",
    responses(
        (status = 200, description = "Current shipping options", body = ApiResponse<ShippingOptions>),
    ),
    tag = "shipping"
)]
pub async fn shipping_options(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ShippingOptions>>, ServiceError> {
    let options = state.services.shipping.options().await?;
    Ok(Json(ApiResponse::success(options)))
}
