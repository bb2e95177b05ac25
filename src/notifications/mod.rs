use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::entities::order;

/// Outbound transactional email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body_html: String,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Mail transport error: {0}")]
    Transport(String),
    #[error("Mail relay rejected message with status {0}")]
    Rejected(u16),
}

/// Fire-and-forget mail sink. Implementations must return promptly and
/// never surface delivery failures to the caller.
pub trait NotificationDispatcher: Send + Sync {
    fn send(&self, to: &str, subject: &str, body_html: &str);
}

/// Delivers a single message; retries are the dispatcher's concern.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, mail: &Notification) -> Result<(), NotificationError>;
}

/// Posts messages as JSON to an HTTP mail relay.
#[derive(Clone)]
pub struct HttpMailTransport {
    client: reqwest::Client,
    endpoint: String,
    from: String,
}

impl HttpMailTransport {
    pub fn new(endpoint: String, from: String, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            from,
        })
    }
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn deliver(&self, mail: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RelayMessage {
                from: &self.from,
                to: &mail.to,
                subject: &mail.subject,
                html: &mail.body_html,
            })
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotificationError::Rejected(response.status().as_u16()))
        }
    }
}

/// Used when no relay is configured.
#[derive(Clone, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn deliver(&self, mail: &Notification) -> Result<(), NotificationError> {
        info!(to = %mail.to, subject = %mail.subject, "mail relay not configured; logging message");
        Ok(())
    }
}

/// Hands messages to a background worker over a bounded channel.
/// `send` never awaits, so a slow relay cannot stall order fulfillment.
#[derive(Clone)]
pub struct QueuedNotificationDispatcher {
    tx: mpsc::Sender<Notification>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl QueuedNotificationDispatcher {
    /// Spawns the delivery worker and returns the dispatcher feeding it.
    pub fn spawn(
        transport: Arc<dyn MailTransport>,
        capacity: usize,
        policy: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(rx, transport, policy));
        (Self { tx }, worker)
    }
}

impl NotificationDispatcher for QueuedNotificationDispatcher {
    fn send(&self, to: &str, subject: &str, body_html: &str) {
        let mail = Notification {
            to: to.to_string(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
        };

        match self.tx.try_send(mail) {
            Ok(()) => {}
            Err(TrySendError::Full(mail)) => {
                metrics::counter!("storefront_notifications_failed", 1, "reason" => "queue_full");
                warn!(to = %mail.to, subject = %mail.subject, "notification queue full; message dropped");
            }
            Err(TrySendError::Closed(mail)) => {
                metrics::counter!("storefront_notifications_failed", 1, "reason" => "worker_stopped");
                error!(to = %mail.to, subject = %mail.subject, "notification worker stopped; message dropped");
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<Notification>,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
) {
    while let Some(mail) = rx.recv().await {
        deliver_with_retry(transport.as_ref(), &mail, &policy).await;
    }
    info!("Notification worker stopped");
}

#[instrument(skip(transport, mail, policy), fields(to = %mail.to, subject = %mail.subject))]
async fn deliver_with_retry(transport: &dyn MailTransport, mail: &Notification, policy: &RetryPolicy) {
    let attempts = policy.max_retries + 1;

    for attempt in 1..=attempts {
        match transport.deliver(mail).await {
            Ok(()) => {
                info!(attempt, "notification delivered");
                return;
            }
            Err(e) => {
                warn!(attempt, attempts, error = %e, "notification delivery failed");
            }
        }

        if attempt < attempts {
            tokio::time::sleep(policy.base_backoff * 2_u32.pow(attempt - 1)).await;
        }
    }

    metrics::counter!("storefront_notifications_failed", 1, "reason" => "retries_exhausted");
    error!(attempts, "notification abandoned after retries");
}

/// Confirmation mail sent once an order's payment is reconciled.
pub fn order_confirmation(order: &order::Model) -> Notification {
    let body_html = format!(
        "<p>Hi {name},</p>\
         <p>Thank you for your purchase. Your order <strong>{number}</strong> has been confirmed \
         and is now being processed.</p>\
         <p>Total paid: {currency} {total}</p>",
        name = escape_html(&order.customer_name),
        number = escape_html(&order.order_number),
        currency = order.currency,
        total = order.total.round_dp(2),
    );

    Notification {
        to: order.customer_email.clone(),
        subject: format!("Order {} confirmed", order.order_number),
        body_html,
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
