//! Order state machine and seller-driven status updates
//!
//! `pending -> processing` belongs to the reconciliation engine; sellers
//! move orders forward one step at a time from there, or cancel them
//! before delivery.

use crate::database::error::DatabaseError;
use crate::database::order_repository::{Order, OrderItem, OrderRepository, StatusHistoryEntry};
use crate::database::payment_repository::{Payment, PaymentRepository};
use crate::error::{AppError, DomainError};
use crate::services::notification::{notify, Notification, NotificationSink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Placed, waiting for the deposit
    Pending,
    /// Deposit received
    Processing,
    Packed,
    OnTheWay,
    Delivered,
    Cancelled,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_status())
    }
}

impl OrderStatus {
    /// Every transition the lifecycle allows, payment-driven ones included
    pub fn valid_transitions(&self) -> Vec<OrderStatus> {
        match self {
            OrderStatus::Pending => vec![OrderStatus::Processing, OrderStatus::Cancelled],
            OrderStatus::Processing => vec![OrderStatus::Packed, OrderStatus::Cancelled],
            OrderStatus::Packed => vec![OrderStatus::OnTheWay, OrderStatus::Cancelled],
            OrderStatus::OnTheWay => vec![OrderStatus::Delivered, OrderStatus::Cancelled],
            // Terminal states - no valid transitions
            OrderStatus::Delivered => vec![],
            OrderStatus::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Transitions only the reconciliation engine may apply
    pub fn is_payment_driven(from: OrderStatus, to: OrderStatus) -> bool {
        from == OrderStatus::Pending && to == OrderStatus::Processing
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Percentage shown on the order tracking bar
    pub fn progress(&self) -> u8 {
        match self {
            OrderStatus::Pending => 20,
            OrderStatus::Processing => 40,
            OrderStatus::Packed => 60,
            OrderStatus::OnTheWay => 80,
            OrderStatus::Delivered => 100,
            OrderStatus::Cancelled => 0,
        }
    }

    pub fn from_db_status(status: &str) -> Option<Self> {
        match status.to_lowercase().as_str() {
            "pending" => Some(OrderStatus::Pending),
            "processing" => Some(OrderStatus::Processing),
            "packed" => Some(OrderStatus::Packed),
            "on_the_way" => Some(OrderStatus::OnTheWay),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    pub fn to_db_status(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Packed => "packed",
            OrderStatus::OnTheWay => "on_the_way",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    fn default_note(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Order placed",
            OrderStatus::Processing => "Payment confirmed",
            OrderStatus::Packed => "Order packed",
            OrderStatus::OnTheWay => "Order is on the way",
            OrderStatus::Delivered => "Order delivered",
            OrderStatus::Cancelled => "Order cancelled by seller",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {0} has no items")]
    NoItems(String),

    #[error("caller is not a seller on order {0}")]
    NotSeller(String),

    #[error("order {order_code} cannot move from {from} to {to}")]
    InvalidTransition {
        order_code: String,
        from: String,
        to: String,
    },

    #[error("order {0} leaves pending only when its deposit is paid")]
    PaymentDriven(String),

    #[error("order {0} changed while being updated")]
    Conflict(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::OrderNotFound(order_code) => {
                AppError::domain(DomainError::OrderNotFound { order_code })
            }
            LifecycleError::NoItems(order_code) => {
                AppError::domain(DomainError::NotOrderSeller { order_code })
                    .with_context("order has no items")
            }
            LifecycleError::NotSeller(order_code) => {
                AppError::domain(DomainError::NotOrderSeller { order_code })
            }
            LifecycleError::InvalidTransition {
                order_code,
                from,
                to,
            } => AppError::domain(DomainError::InvalidStatusTransition {
                order_code,
                from,
                to,
            }),
            LifecycleError::PaymentDriven(order_code) => {
                AppError::domain(DomainError::InvalidStatusTransition {
                    order_code,
                    from: OrderStatus::Pending.to_string(),
                    to: OrderStatus::Processing.to_string(),
                })
                .with_context("orders are confirmed automatically once the deposit is paid")
            }
            LifecycleError::Conflict(order_code) => {
                AppError::domain(DomainError::ConcurrentUpdate { order_code })
            }
            LifecycleError::Database(e) => e.into(),
        }
    }
}

/// Everything the order tracking page shows
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payment: Option<Payment>,
    pub history: Vec<StatusHistoryEntry>,
    pub progress: u8,
}

pub struct OrderLifecycleService {
    orders: Arc<dyn OrderRepository>,
    payments: Arc<dyn PaymentRepository>,
    notifier: Arc<dyn NotificationSink>,
}

impl OrderLifecycleService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        payments: Arc<dyn PaymentRepository>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            orders,
            payments,
            notifier,
        }
    }

    pub async fn order_details(&self, order_code: &str) -> Result<OrderDetails, LifecycleError> {
        let order = self
            .orders
            .find_by_code(order_code)
            .await?
            .ok_or_else(|| LifecycleError::OrderNotFound(order_code.to_string()))?;

        let items = self.orders.items_for_order(order.id).await?;
        let payment = self.payments.find_by_order(order.id).await?;
        let history = self.orders.status_history(order.id).await?;
        let progress = OrderStatus::from_db_status(&order.status)
            .map(|s| s.progress())
            .unwrap_or(0);

        Ok(OrderDetails {
            order,
            items,
            payment,
            history,
            progress,
        })
    }

    /// Move an order one step forward (or cancel it) on behalf of a seller.
    pub async fn advance_status(
        &self,
        order_code: &str,
        seller_id: Uuid,
        target: OrderStatus,
        note: Option<String>,
    ) -> Result<Order, LifecycleError> {
        let order = self
            .orders
            .find_by_code(order_code)
            .await?
            .ok_or_else(|| LifecycleError::OrderNotFound(order_code.to_string()))?;

        let sellers = self.orders.sellers_for_order(order.id).await?;
        if sellers.is_empty() {
            return Err(LifecycleError::NoItems(order_code.to_string()));
        }
        if !sellers.contains(&seller_id) {
            warn!(order_code = %order_code, seller_id = %seller_id, "Status update by non-seller rejected");
            return Err(LifecycleError::NotSeller(order_code.to_string()));
        }

        let current = OrderStatus::from_db_status(&order.status).ok_or_else(|| {
            LifecycleError::InvalidTransition {
                order_code: order_code.to_string(),
                from: order.status.clone(),
                to: target.to_string(),
            }
        })?;

        if OrderStatus::is_payment_driven(current, target) {
            return Err(LifecycleError::PaymentDriven(order_code.to_string()));
        }
        if !current.can_transition_to(target) {
            return Err(LifecycleError::InvalidTransition {
                order_code: order_code.to_string(),
                from: current.to_string(),
                to: target.to_string(),
            });
        }

        let note = note
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| target.default_note().to_string());

        let updated = self
            .orders
            .transition_status(order.id, current.to_db_status(), target.to_db_status(), &note)
            .await?
            .ok_or_else(|| LifecycleError::Conflict(order_code.to_string()))?;

        info!(
            order_code = %order_code,
            seller_id = %seller_id,
            from = %current,
            to = %target,
            "Order status updated"
        );

        match target {
            OrderStatus::OnTheWay => {
                notify(self.notifier.as_ref(), Notification::order_shipped(&updated)).await
            }
            OrderStatus::Delivered => {
                notify(self.notifier.as_ref(), Notification::order_delivered(&updated)).await
            }
            _ => {}
        }

        Ok(updated)
    }
}
