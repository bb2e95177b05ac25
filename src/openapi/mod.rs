use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "1.0.0",
        description = r#"
# Storefront order and payment API

Checkout, payment reconciliation and order self-service for the storefront.

## Checkout flow

1. `POST /api/v1/coupons/validate` to preview a coupon (never redeems it)
2. `POST /api/v1/orders` prices the cart from the catalog and opens a gateway charge
3. The customer pays with the gateway using the returned `gateway_order_id`
4. `POST /api/v1/payments/verify` relays the signed gateway result; stock, coupon
   usage and order status are settled exactly once

## Authentication

Order creation accepts guests. Order lookup and self-service endpoints require a
bearer JWT; administrative endpoints require the `admin` role.

```
Authorization: Bearer <your-jwt-token>
```

## Error Handling

```json
{
  "error": "Precondition Failed",
  "message": "order cannot be cancelled while SHIPPED",
  "request_id": "2c4e...",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "orders", description = "Checkout and customer order endpoints"),
        (name = "coupons", description = "Coupon validation"),
        (name = "payments", description = "Gateway payment verification"),
        (name = "shipping", description = "Shipping options"),
        (name = "admin", description = "Operator endpoints")
    ),
    paths(
        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,
        crate::handlers::orders::return_order,

        // Coupons
        crate::handlers::coupons::validate_coupon,

        // Payments
        crate::handlers::payments::verify_payment,

        // Shipping
        crate::handlers::shipping::shipping_options,

        // Admin
        crate::handlers::admin::update_order_status,
    ),
    components(
        schemas(
            // Order types
            crate::handlers::orders::CreateOrderRequest,
            crate::handlers::orders::CustomerRequest,
            crate::handlers::orders::OrderItemRequest,
            crate::handlers::orders::CreateOrderResponse,
            crate::handlers::orders::ReasonRequest,
            crate::handlers::orders::OrderResponse,
            crate::handlers::orders::OrderItemResponse,
            crate::entities::order::OrderStatus,
            crate::entities::order::PaymentStatus,
            crate::entities::order::ShippingMethod,
            crate::entities::order::ShippingAddress,

            // Coupon types
            crate::handlers::coupons::ValidateCouponRequest,
            crate::handlers::coupons::CouponValidationResponse,
            crate::entities::commerce::DiscountType,

            // Payment types
            crate::handlers::payments::VerifyPaymentRequest,
            crate::handlers::payments::PaymentVerificationResponse,

            // Shipping types
            crate::services::shipping::ShippingOptions,
            crate::services::shipping::ShippingOption,

            // Admin types
            crate::handlers::admin::UpdateStatusRequest,

            // Error types
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
