// Checkout
pub mod coupons;
pub mod pricing;
pub mod shipping;

// Order lifecycle
pub mod order_status;
pub mod orders;

// Payments
pub mod fulfillment;
pub mod payment_gateway;
