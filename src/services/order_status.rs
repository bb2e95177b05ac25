use std::sync::Arc;

use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect,
    TransactionTrait,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
    errors::ServiceError,
    events::{Event, EventSender},
};

pub const MAX_REASON_LEN: usize = 500;

/// A requested move through the order lifecycle.
///
/// `PENDING -> PROCESSING` is deliberately absent: only payment
/// reconciliation performs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// Customer asks to cancel before shipment
    RequestCancel { reason: String },
    /// Customer asks to return after shipment
    RequestReturn { reason: String },
    /// Operator moves the order to `target`
    Operator { target: OrderStatus },
}

impl StatusChange {
    fn reason(&self) -> Option<&str> {
        match self {
            StatusChange::RequestCancel { reason } | StatusChange::RequestReturn { reason } => {
                Some(reason)
            }
            StatusChange::Operator { .. } => None,
        }
    }
}

pub fn can_request_cancel(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Pending | OrderStatus::Processing)
}

pub fn can_request_return(status: OrderStatus) -> bool {
    matches!(status, OrderStatus::Shipped | OrderStatus::Delivered)
}

/// Operator transitions: `PROCESSING -> SHIPPED`, `SHIPPED -> DELIVERED`,
/// anything not yet cancelled `-> CANCELLED`.
pub fn is_operator_transition(from: OrderStatus, to: OrderStatus) -> bool {
    match (from, to) {
        (OrderStatus::Processing, OrderStatus::Shipped) => true,
        (OrderStatus::Shipped, OrderStatus::Delivered) => true,
        (OrderStatus::Cancelled, OrderStatus::Cancelled) => false,
        (_, OrderStatus::Cancelled) => true,
        _ => false,
    }
}

/// Resolves the status `change` leads to from `current`, or explains why it
/// is not allowed.
pub fn next_status(current: OrderStatus, change: &StatusChange) -> Result<OrderStatus, ServiceError> {
    match change {
        StatusChange::RequestCancel { .. } if can_request_cancel(current) => {
            Ok(OrderStatus::CancelRequested)
        }
        StatusChange::RequestCancel { .. } => Err(ServiceError::PreconditionFailed(format!(
            "order cannot be cancelled while {}",
            current
        ))),
        StatusChange::RequestReturn { .. } if can_request_return(current) => {
            Ok(OrderStatus::ReturnRequested)
        }
        StatusChange::RequestReturn { .. } => Err(ServiceError::PreconditionFailed(format!(
            "order cannot be returned while {}",
            current
        ))),
        StatusChange::Operator { target } if is_operator_transition(current, *target) => {
            Ok(*target)
        }
        StatusChange::Operator { target } => Err(ServiceError::PreconditionFailed(format!(
            "cannot move order from {} to {}",
            current, target
        ))),
    }
}

fn validate_reason(change: &StatusChange) -> Result<(), ServiceError> {
    if let Some(reason) = change.reason() {
        let trimmed = reason.trim();
        if trimmed.is_empty() {
            return Err(ServiceError::ValidationError("reason is required".to_string()));
        }
        if trimmed.chars().count() > MAX_REASON_LEN {
            return Err(ServiceError::ValidationError(format!(
                "reason must be at most {} characters",
                MAX_REASON_LEN
            )));
        }
    }
    Ok(())
}

/// Applies lifecycle transitions to persisted orders.
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    events: Arc<EventSender>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, events: Arc<EventSender>) -> Self {
        Self { db, events }
    }

    /// Applies `change` to the order. With `customer_id` set the order must
    /// belong to that customer; anything else reads as not found.
    #[instrument(skip(self, change), fields(order_id = %order_id))]
    pub async fn apply(
        &self,
        order_id: Uuid,
        customer_id: Option<Uuid>,
        change: StatusChange,
    ) -> Result<OrderModel, ServiceError> {
        validate_reason(&change)?;

        let txn = self.db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .filter(|o| customer_id.map_or(true, |c| o.is_owned_by(c)))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let old_status = order.status;
        let new_status = match next_status(old_status, &change) {
            Ok(status) => status,
            Err(e) => {
                warn!(%old_status, error = %e, "order status change refused");
                return Err(e);
            }
        };

        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()));
        match &change {
            StatusChange::RequestCancel { reason } => {
                update = update.col_expr(order::Column::CancelReason, Expr::value(reason.trim()));
            }
            StatusChange::RequestReturn { reason } => {
                update = update.col_expr(order::Column::ReturnReason, Expr::value(reason.trim()));
            }
            StatusChange::Operator { .. } => {}
        }

        // Status guard keeps a concurrent reconcile or request from being overwritten.
        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(old_status))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            return Err(ServiceError::PreconditionFailed(
                "order status changed concurrently; retry".to_string(),
            ));
        }

        let updated = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        txn.commit().await?;

        info!(%old_status, %new_status, "order status updated");

        match change {
            StatusChange::RequestCancel { reason } => {
                self.events
                    .send_or_log(Event::CancellationRequested { order_id, reason })
                    .await
            }
            StatusChange::RequestReturn { reason } => {
                self.events
                    .send_or_log(Event::ReturnRequested { order_id, reason })
                    .await
            }
            StatusChange::Operator { .. } => {}
        }
        self.events
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            })
            .await;

        Ok(updated)
    }
}
