use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait,
    ActiveValue::{NotSet, Set},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, TransactionTrait,
};
use serde::Serialize;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::{
        order::{
            self, Entity as OrderEntity, OrderStatus, PaymentStatus, ShippingAddress,
            ShippingMethod,
        },
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        coupons::{CouponRejection, CouponService},
        order_status::{OrderStatusService, StatusChange},
        payment_gateway::PaymentGateway,
        pricing::{reprice_lines, subtotal_of, LineRequest, PricedLine, PricingCalculator},
        shipping::ShippingSettingsService,
    },
};

const ORDER_NUMBER_PREFIX: &str = "ORD-";
const ORDER_NUMBER_LEN: usize = 8;
const ORDER_NUMBER_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ORDER_NUMBER_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// Checkout submitted by the storefront, already shape-validated.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub customer: CustomerInfo,
    pub shipping_address: ShippingAddress,
    pub shipping_method: ShippingMethod,
    pub items: Vec<LineRequest>,
    pub coupon_code: Option<String>,
}

/// What the client needs to complete payment with the gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub order_number: String,
    pub gateway_order_id: String,
    /// Minor units
    pub amount: i64,
    pub currency: String,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// Service for creating and managing storefront orders
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    events: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    coupons: CouponService,
    shipping: ShippingSettingsService,
    status: OrderStatusService,
    pricing: PricingCalculator,
    currency: String,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        events: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        pricing: PricingCalculator,
        currency: String,
    ) -> Self {
        Self {
            coupons: CouponService::new(db.clone(), pricing.minor_exponent()),
            shipping: ShippingSettingsService::new(db.clone()),
            status: OrderStatusService::new(db.clone(), events.clone()),
            db,
            events,
            gateway,
            pricing,
            currency,
        }
    }

    /// Prices the cart from the catalog, opens a gateway charge and only then
    /// persists the order as `PENDING`/`PENDING`.
    #[instrument(skip(self, new_order), fields(items = new_order.items.len()))]
    pub async fn create_order(
        &self,
        customer_id: Option<Uuid>,
        new_order: NewOrder,
    ) -> Result<CreatedOrder, ServiceError> {
        let lines = reprice_lines(&*self.db, &new_order.items).await?;
        let subtotal = subtotal_of(&lines);

        let coupon = match normalized_coupon(new_order.coupon_code.as_deref()) {
            Some(code) => {
                let applied = self
                    .coupons
                    .evaluate(&code, Some(subtotal), Utc::now())
                    .await?
                    .map_err(|reason| match reason {
                        CouponRejection::InvalidCode => {
                            ServiceError::NotFound(format!("coupon {}: {}", code, reason))
                        }
                        _ => ServiceError::ValidationError(format!("coupon {}: {}", code, reason)),
                    })?;
                Some(applied)
            }
            None => None,
        };
        let discount = coupon
            .as_ref()
            .map_or(Decimal::ZERO, |c| c.discount_amount);

        let shipping_cost = self.shipping.cost_for(new_order.shipping_method).await?;
        let breakdown = self.pricing.price(subtotal, shipping_cost, discount)?;

        let order_id = Uuid::new_v4();
        let charge = self
            .gateway
            .create_charge(breakdown.total_minor, &self.currency, &order_id.to_string())
            .await?;

        if charge.amount != breakdown.total_minor {
            error!(
                gateway_order_id = %charge.gateway_order_id,
                expected = breakdown.total_minor,
                charged = charge.amount,
                "gateway charge amount mismatch"
            );
            return Err(ServiceError::PaymentInitializationFailed(
                "charge amount mismatch".to_string(),
            ));
        }

        let now = Utc::now();

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: NotSet,
            customer_id: Set(customer_id),
            customer_name: Set(new_order.customer.name.trim().to_string()),
            customer_email: Set(new_order.customer.email.trim().to_lowercase()),
            customer_phone: Set(new_order.customer.phone),
            subtotal: Set(breakdown.subtotal),
            discount: Set(breakdown.discount),
            shipping_cost: Set(breakdown.shipping_cost),
            total: Set(breakdown.total),
            currency: Set(self.currency.clone()),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            shipping_method: Set(new_order.shipping_method),
            shipping_address: Set(new_order.shipping_address),
            coupon_code: Set(coupon.map(|c| c.code)),
            gateway_order_id: Set(charge.gateway_order_id.clone()),
            gateway_payment_id: Set(None),
            paid_at: Set(None),
            cancel_reason: Set(None),
            return_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let order_number = match persist_order(&self.db, order, &lines).await {
            Ok(order_number) => order_number,
            Err(e) => {
                // The remote charge exists without an order; it will never be captured.
                error!(
                    gateway_order_id = %charge.gateway_order_id,
                    error = %e,
                    "failed to persist order after gateway charge"
                );
                metrics::counter!("storefront_orders_orphaned_charges", 1);
                return Err(e);
            }
        };

        metrics::counter!("storefront_orders_created", 1);
        info!(%order_id, %order_number, total = %breakdown.total, "order created");

        self.events
            .send_or_log(Event::OrderCreated {
                order_id,
                order_number: order_number.clone(),
                total: breakdown.total,
                gateway_order_id: charge.gateway_order_id.clone(),
            })
            .await;

        Ok(CreatedOrder {
            order_id,
            order_number,
            gateway_order_id: charge.gateway_order_id,
            amount: charge.amount,
            currency: charge.currency,
            total: breakdown.total,
        })
    }

    /// Loads an order with its lines. Non-admin callers only see their own.
    #[instrument(skip(self, viewer), fields(order_id = %order_id))]
    pub async fn get_order(
        &self,
        order_id: Uuid,
        viewer: &AuthUser,
    ) -> Result<OrderDetails, ServiceError> {
        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .filter(|o| viewer.is_admin() || o.is_owned_by(viewer.user_id))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await?;

        Ok(OrderDetails { order, items })
    }

    pub async fn request_cancel(
        &self,
        order_id: Uuid,
        customer: &AuthUser,
        reason: String,
    ) -> Result<order::Model, ServiceError> {
        self.status
            .apply(
                order_id,
                Some(customer.user_id),
                StatusChange::RequestCancel { reason },
            )
            .await
    }

    pub async fn request_return(
        &self,
        order_id: Uuid,
        customer: &AuthUser,
        reason: String,
    ) -> Result<order::Model, ServiceError> {
        self.status
            .apply(
                order_id,
                Some(customer.user_id),
                StatusChange::RequestReturn { reason },
            )
            .await
    }

    /// Operator transition; authority is checked at the HTTP boundary.
    pub async fn update_status(
        &self,
        order_id: Uuid,
        target: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        self.status
            .apply(order_id, None, StatusChange::Operator { target })
            .await
    }
}

fn normalized_coupon(code: Option<&str>) -> Option<String> {
    code.map(crate::entities::commerce::coupon::normalize_code)
        .filter(|c| !c.is_empty())
}

fn generate_order_number() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ORDER_NUMBER_LEN)
        .map(|_| ORDER_NUMBER_CHARSET[rng.gen_range(0..ORDER_NUMBER_CHARSET.len())] as char)
        .collect();
    format!("{ORDER_NUMBER_PREFIX}{suffix}")
}

async fn unique_order_number<C: ConnectionTrait>(conn: &C) -> Result<String, ServiceError> {
    for _ in 0..ORDER_NUMBER_ATTEMPTS {
        let candidate = generate_order_number();
        let taken = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(candidate.as_str()))
            .count(conn)
            .await?
            > 0;
        if !taken {
            return Ok(candidate);
        }
    }
    Err(ServiceError::InternalError(
        "could not allocate a unique order number".to_string(),
    ))
}

/// Allocates the order number and inserts the order with its lines in one
/// transaction.
async fn persist_order(
    db: &DatabaseConnection,
    mut order: order::ActiveModel,
    lines: &[PricedLine],
) -> Result<String, ServiceError> {
    let txn = db.begin().await?;
    let order_number = unique_order_number(&txn).await?;
    order.order_number = Set(order_number.clone());
    let order = order.insert(&txn).await?;
    insert_items(&txn, order.id, lines).await?;
    txn.commit().await?;
    Ok(order_number)
}

async fn insert_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    lines: &[PricedLine],
) -> Result<(), sea_orm::DbErr> {
    let now = Utc::now();
    let items = lines.iter().map(|line| order_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        product_id: Set(line.product_id),
        variant_id: Set(line.variant_id),
        name: Set(line.name.clone()),
        quantity: Set(line.quantity),
        unit_price: Set(line.unit_price),
        client_unit_price: Set(line.client_unit_price),
        line_total: Set(line.line_total),
        created_at: Set(now),
    });
    OrderItemEntity::insert_many(items).exec(conn).await?;
    Ok(())
}
