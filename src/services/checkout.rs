//! Checkout Service
//!
//! Turns a validated cart snapshot into an order: items are frozen with their
//! price and seller, the total and 20/80 split are computed once, and the
//! order, payment and first history entry are written together.

use crate::database::error::DatabaseError;
use crate::database::order_repository::{NewOrder, NewOrderItem, Order, OrderRepository};
use crate::database::payment_repository::{Payment, PaymentSplit};
use crate::error::{AppError, AppErrorKind, InfrastructureError, ValidationError};
use crate::services::notification::{notify, Notification, NotificationSink};
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{Datelike, Utc};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const INITIAL_NOTE: &str = "Order placed, awaiting deposit";

/// Upper bound on a single line quantity
const MAX_ITEM_QUANTITY: i32 = 1000;

/// Largest value a `NUMERIC(12, 2)` money column holds, in cents
const MAX_AMOUNT_CENTS: i64 = 999_999_999_999;

fn max_amount() -> BigDecimal {
    BigDecimal::from(MAX_AMOUNT_CENTS) / BigDecimal::from(100)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
    pub seller_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub delivery_address: String,
    #[serde(default)]
    pub delivery_notes: Option<String>,
    pub items: Vec<CheckoutItem>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("order has no items")]
    EmptyOrder,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("no unique order code after {attempts} attempts")]
    DuplicateOrderCode { attempts: u32 },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::EmptyOrder => AppError::validation(ValidationError::MissingField {
                field: "items".to_string(),
            }),
            CheckoutError::InvalidField { field, reason } => {
                AppError::validation(ValidationError::InvalidField { field, reason })
            }
            CheckoutError::DuplicateOrderCode { attempts } => AppError::new(
                AppErrorKind::Infrastructure(InfrastructureError::Database {
                    message: format!("could not allocate an order code after {} attempts", attempts),
                    is_retryable: true,
                }),
            ),
            CheckoutError::Database(e) => e.into(),
        }
    }
}

/// `CR-{year}-{4 random digits}`
pub fn generate_order_code() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..10_000);
    format!("CR-{}-{:04}", Utc::now().year(), suffix)
}

fn invalid(field: &str, reason: &str) -> CheckoutError {
    CheckoutError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn required(field: &str, value: &str) -> Result<String, CheckoutError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

impl CheckoutRequest {
    /// Validate and compute the order total
    fn to_new_order(&self) -> Result<NewOrder, CheckoutError> {
        if self.items.is_empty() {
            return Err(CheckoutError::EmptyOrder);
        }

        let customer_name = required("customer_name", &self.customer_name)?;
        let customer_phone = required("customer_phone", &self.customer_phone)?;
        let delivery_address = required("delivery_address", &self.delivery_address)?;
        let customer_email = required("customer_email", &self.customer_email)?;
        if !customer_email.contains('@') {
            return Err(invalid("customer_email", "must be an email address"));
        }

        let max_amount = max_amount();
        let mut total = BigDecimal::zero();
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if item.quantity < 1 || item.quantity > MAX_ITEM_QUANTITY {
                return Err(invalid("quantity", "must be between 1 and 1000"));
            }
            if item.unit_price < BigDecimal::zero() {
                return Err(invalid("unit_price", "must not be negative"));
            }
            let unit_price = item.unit_price.with_scale_round(2, RoundingMode::HalfUp);
            if unit_price > max_amount {
                return Err(invalid(
                    "unit_price",
                    &format!("must not exceed {}", max_amount),
                ));
            }
            total += &unit_price * BigDecimal::from(item.quantity);
            items.push(NewOrderItem {
                product_id: item.product_id,
                product_name: required("product_name", &item.product_name)?,
                unit_price,
                quantity: item.quantity,
                seller_id: item.seller_id,
            });
        }

        if total <= BigDecimal::zero() {
            return Err(invalid("items", "order total must be positive"));
        }
        if total > max_amount {
            return Err(invalid(
                "items",
                &format!("order total must not exceed {}", max_amount),
            ));
        }

        Ok(NewOrder {
            order_code: String::new(),
            customer_id: self.customer_id,
            customer_name,
            customer_email,
            customer_phone,
            delivery_address,
            delivery_notes: self
                .delivery_notes
                .as_ref()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            total_amount: total,
            items,
        })
    }
}

pub struct CheckoutService {
    orders: Arc<dyn OrderRepository>,
    notifier: Arc<dyn NotificationSink>,
    max_code_attempts: u32,
}

impl CheckoutService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        notifier: Arc<dyn NotificationSink>,
        max_code_attempts: u32,
    ) -> Self {
        Self {
            orders,
            notifier,
            max_code_attempts: max_code_attempts.max(1),
        }
    }

    pub async fn place_order(
        &self,
        request: &CheckoutRequest,
    ) -> Result<(Order, Payment), CheckoutError> {
        let mut new_order = request.to_new_order()?;
        let split = PaymentSplit::from_total(&new_order.total_amount);

        for attempt in 1..=self.max_code_attempts {
            new_order.order_code = generate_order_code();

            match self.orders.create_order(&new_order, &split, INITIAL_NOTE).await {
                Ok((order, payment)) => {
                    info!(
                        order_code = %order.order_code,
                        total = %order.total_amount,
                        deposit = %payment.deposit_amount,
                        items = new_order.items.len(),
                        "Order placed"
                    );
                    notify(self.notifier.as_ref(), Notification::order_placed(&order)).await;
                    return Ok((order, payment));
                }
                Err(e) if e.is_unique_violation() => {
                    warn!(
                        order_code = %new_order.order_code,
                        attempt = attempt,
                        "Order code collision, regenerating"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CheckoutError::DuplicateOrderCode {
            attempts: self.max_code_attempts,
        })
    }
}
