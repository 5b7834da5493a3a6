use crate::database::error::DatabaseError;
use crate::database::order_repository::Order;
use crate::logging::mask_email;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    OrderPlaced,
    OrderConfirmed,
    OrderShipped,
    OrderDelivered,
    DeliveryConfirmed,
    ReviewReceived,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::OrderPlaced => "order_placed",
            NotificationType::OrderConfirmed => "order_confirmed",
            NotificationType::OrderShipped => "order_shipped",
            NotificationType::OrderDelivered => "order_delivered",
            NotificationType::DeliveryConfirmed => "delivery_confirmed",
            NotificationType::ReviewReceived => "review_received",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    Customer {
        user_id: Option<Uuid>,
        email: String,
    },
    Seller {
        seller_id: Uuid,
    },
}

impl Recipient {
    pub fn customer_of(order: &Order) -> Self {
        Recipient::Customer {
            user_id: order.customer_id,
            email: order.customer_email.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationType,
    pub recipient: Recipient,
    pub order_code: Option<String>,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn order_placed(order: &Order) -> Self {
        Self {
            kind: NotificationType::OrderPlaced,
            recipient: Recipient::customer_of(order),
            order_code: Some(order.order_code.clone()),
            title: "Order Placed Successfully".to_string(),
            message: format!(
                "Your order {} for KES {} has been placed. Pay the deposit to confirm it.",
                order.order_code, order.total_amount
            ),
        }
    }

    pub fn order_confirmed(order: &Order, receipt: Option<&str>) -> Self {
        let message = match receipt {
            Some(receipt) => format!(
                "Your deposit for order {} was received (M-PESA receipt {}). The seller is preparing your order.",
                order.order_code, receipt
            ),
            None => format!(
                "Your deposit for order {} was received. The seller is preparing your order.",
                order.order_code
            ),
        };
        Self {
            kind: NotificationType::OrderConfirmed,
            recipient: Recipient::customer_of(order),
            order_code: Some(order.order_code.clone()),
            title: "Your Order Has Been Confirmed".to_string(),
            message,
        }
    }

    pub fn order_shipped(order: &Order) -> Self {
        Self {
            kind: NotificationType::OrderShipped,
            recipient: Recipient::customer_of(order),
            order_code: Some(order.order_code.clone()),
            title: "Your Order is On The Way".to_string(),
            message: format!("Order {} is on its way to you.", order.order_code),
        }
    }

    pub fn order_delivered(order: &Order) -> Self {
        Self {
            kind: NotificationType::OrderDelivered,
            recipient: Recipient::customer_of(order),
            order_code: Some(order.order_code.clone()),
            title: "Your Order Has Been Delivered".to_string(),
            message: format!(
                "Order {} has been delivered. Please confirm delivery and leave a review.",
                order.order_code
            ),
        }
    }

    pub fn delivery_confirmed(order: &Order, seller_id: Uuid) -> Self {
        Self {
            kind: NotificationType::DeliveryConfirmed,
            recipient: Recipient::Seller { seller_id },
            order_code: Some(order.order_code.clone()),
            title: format!("Delivery Confirmed for Order {}", order.order_code),
            message: format!(
                "{} confirmed receiving order {}.",
                order.customer_name, order.order_code
            ),
        }
    }

    pub fn review_received(order: &Order, seller_id: Uuid, rating: i16) -> Self {
        Self {
            kind: NotificationType::ReviewReceived,
            recipient: Recipient::Seller { seller_id },
            order_code: Some(order.order_code.clone()),
            title: format!("New {}-Star Review from {}", rating, order.customer_name),
            message: format!(
                "{} reviewed their purchase on order {}.",
                order.customer_name, order.order_code
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification could not be stored: {0}")]
    Storage(#[from] DatabaseError),
}

/// Destination for user-facing notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Send a notification, logging instead of failing when the sink errors
pub async fn notify(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.send(&notification).await {
        warn!(
            kind = %notification.kind,
            order_code = ?notification.order_code,
            error = %e,
            "Notification could not be delivered"
        );
    }
}

fn log_notification(notification: &Notification) {
    match &notification.recipient {
        Recipient::Customer { user_id, email } => info!(
            kind = %notification.kind,
            order_code = ?notification.order_code,
            user_id = ?user_id,
            email = %mask_email(email),
            "🔔 NOTIFICATION: {} - {}", notification.title, notification.message
        ),
        Recipient::Seller { seller_id } => info!(
            kind = %notification.kind,
            order_code = ?notification.order_code,
            seller_id = %seller_id,
            "🔔 NOTIFICATION: {} - {}", notification.title, notification.message
        ),
    }
}

/// Structured-log-only sink
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSink;

impl LogNotificationSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        log_notification(notification);
        Ok(())
    }
}

/// Writes an in-app inbox row and logs it
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let (recipient_kind, recipient_id, recipient_email) = match &notification.recipient {
            Recipient::Customer { user_id, email } => ("customer", *user_id, Some(email.clone())),
            Recipient::Seller { seller_id } => ("seller", Some(*seller_id), None),
        };

        sqlx::query(
            "INSERT INTO notifications \
                 (recipient_kind, recipient_id, recipient_email, kind, title, message, order_code) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(recipient_kind)
        .bind(recipient_id)
        .bind(recipient_email)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(&notification.order_code)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        log_notification(notification);
        Ok(())
    }
}
