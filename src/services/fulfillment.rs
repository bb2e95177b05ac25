/*!
 * # Payment reconciliation
 *
 * Turns a verified gateway callback into business state: stock, sales
 * counters, coupon usage and the order's payment fields change together in
 * one transaction, exactly once per order however often the gateway
 * redelivers the callback. The confirmation mail goes out after commit.
 */

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QuerySelect, TransactionTrait,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        commerce::product_variant::{self, Entity as ProductVariant},
        order::{self, Entity as OrderEntity, OrderStatus, PaymentStatus},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as Product},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    notifications::{order_confirmation, NotificationDispatcher},
    services::{coupons::CouponService, payment_gateway::verify_signature},
};

/// Signed payment callback as relayed by the storefront
#[derive(Debug, Clone)]
pub struct PaymentCallback {
    pub order_id: Uuid,
    pub gateway_order_id: String,
    pub gateway_payment_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub order: order::Model,
    /// The order had already been paid; nothing was changed
    pub replayed: bool,
}

enum Applied {
    Paid {
        order: order::Model,
        old_status: OrderStatus,
    },
    AlreadyPaid(order::Model),
}

#[derive(Clone)]
pub struct FulfillmentService {
    db: Arc<DatabaseConnection>,
    events: Arc<EventSender>,
    notifier: Arc<dyn NotificationDispatcher>,
    callback_secret: String,
}

impl FulfillmentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        events: Arc<EventSender>,
        notifier: Arc<dyn NotificationDispatcher>,
        callback_secret: String,
    ) -> Self {
        Self {
            db,
            events,
            notifier,
            callback_secret,
        }
    }

    /// Verifies the callback signature, then reconciles. A bad signature
    /// is rejected before the store is touched.
    #[instrument(skip(self, callback), fields(order_id = %callback.order_id, gateway_order_id = %callback.gateway_order_id))]
    pub async fn handle_callback(
        &self,
        callback: PaymentCallback,
    ) -> Result<ReconcileOutcome, ServiceError> {
        if !verify_signature(
            &callback.gateway_order_id,
            &callback.gateway_payment_id,
            &callback.signature,
            &self.callback_secret,
        ) {
            metrics::counter!("storefront_signature_failures", 1);
            warn!(
                gateway_payment_id = %callback.gateway_payment_id,
                "payment callback signature mismatch; possible tampering"
            );
            self.events
                .send_or_log(Event::SignatureRejected {
                    gateway_order_id: callback.gateway_order_id,
                })
                .await;
            return Err(ServiceError::InvalidSignature);
        }

        self.reconcile(
            callback.order_id,
            &callback.gateway_order_id,
            &callback.gateway_payment_id,
        )
        .await
    }

    /// Marks a verified payment on the order. Callers must have checked the
    /// signature.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn reconcile(
        &self,
        order_id: Uuid,
        gateway_order_id: &str,
        gateway_payment_id: &str,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let txn = self.db.begin().await.map_err(fulfillment_error)?;

        let applied = apply_payment(&txn, order_id, gateway_order_id, gateway_payment_id)
            .await
            .map_err(|e| match e {
                ServiceError::NotFound(_) | ServiceError::BadRequest(_) => e,
                other => fulfillment_error(other),
            })?;

        txn.commit().await.map_err(fulfillment_error)?;

        match applied {
            Applied::AlreadyPaid(order) => {
                metrics::counter!("storefront_payment_replays", 1);
                info!(
                    existing_payment_id = order.gateway_payment_id.as_deref().unwrap_or_default(),
                    gateway_payment_id, "order already paid; callback ignored"
                );
                self.events
                    .send_or_log(Event::PaymentReplayIgnored {
                        order_id,
                        gateway_payment_id: gateway_payment_id.to_string(),
                    })
                    .await;
                Ok(ReconcileOutcome {
                    order,
                    replayed: true,
                })
            }
            Applied::Paid { order, old_status } => {
                metrics::counter!("storefront_orders_paid", 1);
                info!(order_number = %order.order_number, "payment reconciled");

                let mail = order_confirmation(&order);
                self.notifier.send(&mail.to, &mail.subject, &mail.body_html);

                self.events
                    .send_or_log(Event::OrderPaid {
                        order_id,
                        gateway_payment_id: gateway_payment_id.to_string(),
                    })
                    .await;
                if old_status != order.status {
                    self.events
                        .send_or_log(Event::OrderStatusChanged {
                            order_id,
                            old_status,
                            new_status: order.status,
                        })
                        .await;
                }

                Ok(ReconcileOutcome {
                    order,
                    replayed: false,
                })
            }
        }
    }
}

fn fulfillment_error(err: impl Into<ServiceError>) -> ServiceError {
    let err = err.into();
    error!(error = %err, "payment reconciliation rolled back");
    ServiceError::FulfillmentFailed(err.to_string())
}

async fn apply_payment(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    gateway_order_id: &str,
    gateway_payment_id: &str,
) -> Result<Applied, ServiceError> {
    let order = OrderEntity::find_by_id(order_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    if order.gateway_order_id != gateway_order_id {
        warn!(%order_id, gateway_order_id, "callback references another gateway order");
        return Err(ServiceError::BadRequest(
            "payment does not belong to this order".to_string(),
        ));
    }

    if order.is_paid() {
        return Ok(Applied::AlreadyPaid(order));
    }

    // A customer cancel request placed before payment keeps its status.
    let old_status = order.status;
    let new_status = match old_status {
        OrderStatus::Pending => OrderStatus::Processing,
        other => other,
    };

    // Guard on the unpaid state so only one reconciliation can claim the order.
    let claimed = OrderEntity::update_many()
        .col_expr(order::Column::Status, Expr::value(new_status))
        .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
        .col_expr(order::Column::PaidAt, Expr::value(Utc::now()))
        .col_expr(
            order::Column::GatewayPaymentId,
            Expr::value(gateway_payment_id),
        )
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending))
        .exec(txn)
        .await?;

    if claimed.rows_affected != 1 {
        let current = OrderEntity::find_by_id(order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        return Ok(Applied::AlreadyPaid(current));
    }

    let items = OrderItemEntity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(txn)
        .await?;

    for item in &items {
        adjust_inventory(txn, item).await?;
    }

    if let Some(code) = order.coupon_code.as_deref() {
        CouponService::record_redemption(txn, code).await?;
    }

    let order = OrderEntity::find_by_id(order_id)
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    Ok(Applied::Paid { order, old_status })
}

/// Adds the line to the product's sales counter and takes it out of the
/// variant's stock, or the product's when no variant was ordered.
async fn adjust_inventory<C: ConnectionTrait>(
    conn: &C,
    item: &order_item::Model,
) -> Result<(), ServiceError> {
    let now = Utc::now();

    let mut product_update = Product::update_many()
        .col_expr(
            product::Column::SalesCount,
            Expr::col(product::Column::SalesCount).add(item.quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(now));
    if item.variant_id.is_none() {
        product_update = product_update.col_expr(
            product::Column::StockQuantity,
            Expr::col(product::Column::StockQuantity).sub(item.quantity),
        );
    }
    let result = product_update
        .filter(product::Column::Id.eq(item.product_id))
        .exec(conn)
        .await?;
    if result.rows_affected != 1 {
        return Err(ServiceError::InternalError(format!(
            "product {} missing during reconciliation",
            item.product_id
        )));
    }

    if let Some(variant_id) = item.variant_id {
        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::StockQuantity,
                Expr::col(product_variant::Column::StockQuantity).sub(item.quantity),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(now))
            .filter(product_variant::Column::Id.eq(variant_id))
            .exec(conn)
            .await?;
        if result.rows_affected != 1 {
            return Err(ServiceError::InternalError(format!(
                "variant {} missing during reconciliation",
                variant_id
            )));
        }
    }

    Ok(())
}
