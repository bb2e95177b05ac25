pub mod admin;
pub mod coupons;
pub mod orders;
pub mod payments;
pub mod shipping;

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::{
    config::AppConfig,
    events::EventSender,
    notifications::NotificationDispatcher,
    services::{
        coupons::CouponService, fulfillment::FulfillmentService, orders::OrderService,
        payment_gateway::PaymentGateway, pricing::PricingCalculator,
        shipping::ShippingSettingsService,
    },
};

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub coupons: Arc<CouponService>,
    pub fulfillment: Arc<FulfillmentService>,
    pub shipping: Arc<ShippingSettingsService>,
}

impl AppServices {
    /// Wires the services over one connection pool. The gateway and the
    /// notifier are injected so tests can substitute fakes.
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationDispatcher>,
        config: &AppConfig,
    ) -> Self {
        let pricing =
            PricingCalculator::new(config.gateway_min_amount_minor, config.currency_minor_exponent);

        Self {
            orders: Arc::new(OrderService::new(
                db.clone(),
                event_sender.clone(),
                gateway,
                pricing,
                config.currency.clone(),
            )),
            coupons: Arc::new(CouponService::new(db.clone(), config.currency_minor_exponent)),
            fulfillment: Arc::new(FulfillmentService::new(
                db.clone(),
                event_sender,
                notifier,
                config.gateway_webhook_secret().to_string(),
            )),
            shipping: Arc::new(ShippingSettingsService::new(db)),
        }
    }
}
