use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    auth::{AuthUser, MaybeAuthUser},
    entities::{
        order::{self, OrderStatus, PaymentStatus, ShippingAddress, ShippingMethod},
        order_item,
    },
    errors::ServiceError,
    services::{
        orders::{CreatedOrder, CustomerInfo, NewOrder},
        pricing::{LineRequest, MAX_LINE_QUANTITY},
    },
    ApiResponse, AppState,
};

pub fn orders_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_order))
        .route("/:id", get(get_order))
        .route("/:id/cancel", post(cancel_order))
        .route("/:id/return", post(return_order))
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CustomerRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 5, max = 20))]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderItemRequest {
    /// Product id
    pub id: Uuid,
    pub variant_id: Option<Uuid>,
    #[schema(minimum = 1, maximum = 10000)]
    pub quantity: i32,
    /// Unit price the cart displayed; the catalog price is charged
    pub price: Option<Decimal>,
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    #[validate]
    pub customer: CustomerRequest,
    #[validate]
    pub shipping_address: ShippingAddress,
    #[serde(default = "default_shipping_method")]
    pub shipping_method: ShippingMethod,
    #[validate(length(min = 1, max = 100), custom = "validate_items")]
    pub items: Vec<OrderItemRequest>,
    pub coupon_code: Option<String>,
}

fn default_shipping_method() -> ShippingMethod {
    ShippingMethod::Standard
}

fn validate_items(items: &Vec<OrderItemRequest>) -> Result<(), ValidationError> {
    if items
        .iter()
        .any(|item| item.quantity <= 0 || item.quantity > MAX_LINE_QUANTITY)
    {
        let mut err = ValidationError::new("quantity");
        err.message = Some(format!("quantity must be between 1 and {}", MAX_LINE_QUANTITY).into());
        return Err(err);
    }
    Ok(())
}

impl From<CreateOrderRequest> for NewOrder {
    fn from(req: CreateOrderRequest) -> Self {
        NewOrder {
            customer: CustomerInfo {
                name: req.customer.name,
                email: req.customer.email,
                phone: req.customer.phone,
            },
            shipping_address: req.shipping_address,
            shipping_method: req.shipping_method,
            items: req
                .items
                .into_iter()
                .map(|item| LineRequest {
                    product_id: item.id,
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    client_unit_price: item.price,
                })
                .collect(),
            coupon_code: req.coupon_code,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateOrderResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub gateway_order_id: String,
    /// Amount to collect, in the currency's minor unit
    pub amount: i64,
    pub currency: String,
    pub total: Decimal,
}

impl From<CreatedOrder> for CreateOrderResponse {
    fn from(created: CreatedOrder) -> Self {
        Self {
            order_id: created.order_id,
            order_number: created.order_number,
            gateway_order_id: created.gateway_order_id,
            amount: created.amount,
            currency: created.currency,
            total: created.total,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct ReasonRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemResponse {
    fn from(item: order_item::Model) -> Self {
        Self {
            id: item.id,
            product_id: item.product_id,
            variant_id: item.variant_id,
            name: item.name,
            quantity: item.quantity,
            unit_price: item.unit_price,
            line_total: item.line_total,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub customer_name: String,
    pub customer_email: String,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping_cost: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub shipping_method: ShippingMethod,
    pub shipping_address: ShippingAddress,
    pub coupon_code: Option<String>,
    pub gateway_order_id: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub return_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderResponse {
    pub fn with_items(order: order::Model, items: Vec<order_item::Model>) -> Self {
        let mut response = Self::from(order);
        response.items = items.into_iter().map(OrderItemResponse::from).collect();
        response
    }
}

impl From<order::Model> for OrderResponse {
    fn from(order: order::Model) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_status: order.payment_status,
            customer_name: order.customer_name,
            customer_email: order.customer_email,
            subtotal: order.subtotal,
            discount: order.discount,
            shipping_cost: order.shipping_cost,
            total: order.total,
            currency: order.currency,
            shipping_method: order.shipping_method,
            shipping_address: order.shipping_address,
            coupon_code: order.coupon_code,
            gateway_order_id: order.gateway_order_id,
            paid_at: order.paid_at,
            cancel_reason: order.cancel_reason,
            return_reason: order.return_reason,
            items: Vec::new(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Create an order and open the matching gateway charge
#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Create order",
    description = "Price the cart from the catalog, apply an optional coupon and open a gateway charge. Guests may check out without a token.",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created; complete payment with the gateway", body = ApiResponse<CreateOrderResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid cart, coupon or below-minimum total", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid bearer token", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown coupon code", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment initialization failed", body = crate::errors::ErrorResponse),
    ),
    tag = "orders"
)]
pub async fn create_order(
    State(state): State<AppState>,
    MaybeAuthUser(user): MaybeAuthUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CreateOrderResponse>>), ServiceError> {
    request.validate()?;

    let created = state
        .services
        .orders
        .create_order(user.map(|u| u.user_id), request.into())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(created.into())),
    ))
}

/// Get one of the caller's orders
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderResponse>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let details = state.services.orders.get_order(id, &user).await?;
    Ok(Json(ApiResponse::success(OrderResponse::with_items(
        details.order,
        details.items,
    ))))
}

/// Ask to cancel an order that has not shipped
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Request cancellation",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Cancellation requested", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Missing reason", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 412, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    request.validate()?;
    let order = state
        .services
        .orders
        .request_cancel(id, &user, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}

/// Ask to return a shipped or delivered order
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/return",
    summary = "Request return",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Return requested", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Missing reason", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 412, description = "Order is not eligible for return", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn return_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(request): Json<ReasonRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    request.validate()?;
    let order = state
        .services
        .orders
        .request_return(id, &user, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}
