use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::order::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the loop is gone.
    /// Domain events never decide the outcome of the operation that raised them.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "domain event dropped");
        }
    }
}

/// Domain events raised by the order core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total: Decimal,
        gateway_order_id: String,
    },
    OrderPaid {
        order_id: Uuid,
        gateway_payment_id: String,
    },
    /// A duplicate callback arrived for an order that was already paid
    PaymentReplayIgnored {
        order_id: Uuid,
        gateway_payment_id: String,
    },
    CancellationRequested {
        order_id: Uuid,
        reason: String,
    },
    ReturnRequested {
        order_id: Uuid,
        reason: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    /// Callback whose HMAC did not match; possible tampering
    SignatureRejected {
        gateway_order_id: String,
    },
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                total,
                gateway_order_id,
            } => {
                info!(%order_id, %order_number, %total, %gateway_order_id, "order created");
            }
            Event::OrderPaid {
                order_id,
                gateway_payment_id,
            } => {
                info!(%order_id, %gateway_payment_id, "order paid");
            }
            Event::PaymentReplayIgnored {
                order_id,
                gateway_payment_id,
            } => {
                info!(%order_id, %gateway_payment_id, "duplicate payment callback ignored");
            }
            Event::CancellationRequested { order_id, reason } => {
                info!(%order_id, %reason, "cancellation requested");
            }
            Event::ReturnRequested { order_id, reason } => {
                info!(%order_id, %reason, "return requested");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::SignatureRejected { gateway_order_id } => {
                error!(%gateway_order_id, "payment callback rejected: signature mismatch");
            }
        }
    }

    warn!("Event processing loop has ended");
}
