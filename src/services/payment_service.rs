//! Deposit initiation and status polling
//!
//! Initiation prompts the payer exactly once per request; polling answers
//! from local state once the payment is settled and only asks the gateway
//! while the current attempt is still pending. Whatever the gateway reports
//! goes through the reconciliation engine, never straight to the database.

use crate::database::error::DatabaseError;
use crate::database::order_repository::{Order, OrderRepository};
use crate::database::payment_repository::{NewAttempt, Payment, PaymentRepository, PaymentStatus};
use crate::error::{AppError, DomainError};
use crate::logging::mask_phone;
use crate::payments::error::GatewayError;
use crate::payments::provider::PaymentGatewayClient;
use crate::payments::types::PaymentOutcome;
use crate::payments::utils::to_whole_units;
use crate::services::order_lifecycle::OrderStatus;
use crate::services::reconciliation::{ReconcileError, ReconciliationEngine};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum PaymentServiceError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {0} has no payment record")]
    PaymentNotFound(String),

    #[error("deposit for order {0} already paid")]
    DepositAlreadyPaid(String),

    #[error("order {order_code} is {status} and cannot take payments")]
    OrderClosed { order_code: String, status: String },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<PaymentServiceError> for AppError {
    fn from(err: PaymentServiceError) -> Self {
        match err {
            PaymentServiceError::OrderNotFound(order_code) => {
                AppError::domain(DomainError::OrderNotFound { order_code })
            }
            PaymentServiceError::PaymentNotFound(order_code) => {
                AppError::domain(DomainError::PaymentNotFound { order_code })
            }
            PaymentServiceError::DepositAlreadyPaid(order_code) => {
                AppError::domain(DomainError::DepositAlreadyPaid { order_code })
            }
            PaymentServiceError::OrderClosed { order_code, status } => {
                AppError::domain(DomainError::InvalidStatusTransition {
                    order_code,
                    from: status,
                    to: OrderStatus::Processing.to_string(),
                })
                .with_context("order no longer accepts payments")
            }
            PaymentServiceError::Gateway(e) => e.into(),
            PaymentServiceError::Reconcile(e) => e.into(),
            PaymentServiceError::Database(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InitiateResponse {
    pub success: bool,
    pub message: String,
    pub checkout_request_id: String,
}

/// Payment status as reported to a polling client
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    NoPayment,
    Pending,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PollResponse {
    pub success: bool,
    pub payment_status: PollStatus,
    pub order_status: String,
    pub message: String,
}

impl PollResponse {
    fn from_local(order: &Order, payment: &Payment) -> Self {
        match payment.payment_status() {
            PaymentStatus::Completed => Self {
                success: true,
                payment_status: PollStatus::Completed,
                order_status: order.status.clone(),
                message: match &payment.deposit_receipt {
                    Some(receipt) => format!("Deposit received (receipt {})", receipt),
                    None => "Deposit received".to_string(),
                },
            },
            PaymentStatus::Failed => Self {
                success: false,
                payment_status: PollStatus::Error,
                order_status: order.status.clone(),
                message: payment
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "Payment failed".to_string()),
            },
            PaymentStatus::Pending => Self {
                success: true,
                payment_status: PollStatus::Pending,
                order_status: order.status.clone(),
                message: "Waiting for M-PESA confirmation".to_string(),
            },
        }
    }
}

pub struct PaymentService {
    orders: Arc<dyn OrderRepository>,
    payments: Arc<dyn PaymentRepository>,
    gateway: Arc<dyn PaymentGatewayClient>,
    engine: Arc<ReconciliationEngine>,
    query_max_retries: u32,
    retry_backoff: Duration,
}

impl PaymentService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        payments: Arc<dyn PaymentRepository>,
        gateway: Arc<dyn PaymentGatewayClient>,
        engine: Arc<ReconciliationEngine>,
        query_max_retries: u32,
    ) -> Self {
        Self {
            orders,
            payments,
            gateway,
            engine,
            query_max_retries,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    async fn load(&self, order_code: &str) -> Result<(Order, Option<Payment>), PaymentServiceError> {
        let order = self
            .orders
            .find_by_code(order_code)
            .await?
            .ok_or_else(|| PaymentServiceError::OrderNotFound(order_code.to_string()))?;
        let payment = self.payments.find_by_order(order.id).await?;
        Ok((order, payment))
    }

    /// Prompt the payer for the order's deposit.
    ///
    /// `phone_override` replaces the order's contact phone for this prompt.
    pub async fn initiate_deposit(
        &self,
        order_code: &str,
        phone_override: Option<&str>,
    ) -> Result<InitiateResponse, PaymentServiceError> {
        let (order, payment) = self.load(order_code).await?;
        let payment =
            payment.ok_or_else(|| PaymentServiceError::PaymentNotFound(order_code.to_string()))?;

        if payment.deposit_paid {
            return Err(PaymentServiceError::DepositAlreadyPaid(order_code.to_string()));
        }
        if order.status == OrderStatus::Cancelled.to_db_status() {
            return Err(PaymentServiceError::OrderClosed {
                order_code: order_code.to_string(),
                status: order.status,
            });
        }

        let phone = phone_override
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(order.customer_phone.as_str());
        let amount_units = to_whole_units(&payment.deposit_amount)?;

        // Not retried: a repeat could prompt the payer twice
        let initiated = self
            .gateway
            .initiate_payment(phone, &payment.deposit_amount, &order.order_code)
            .await
            .map_err(|e| {
                warn!(
                    order_code = %order.order_code,
                    phone = %mask_phone(phone),
                    error = %e,
                    "Deposit initiation failed"
                );
                e
            })?;

        let attempt = NewAttempt {
            correlation_id: initiated.correlation_id.clone(),
            phone: initiated.normalized_phone.clone(),
            amount_units,
        };

        if self
            .payments
            .record_initiation(payment.id, &attempt)
            .await?
            .is_none()
        {
            // A concurrent callback completed the deposit while the prompt was in flight
            error!(
                order_code = %order.order_code,
                correlation_id = %initiated.correlation_id,
                "Deposit completed during initiation; payer may be prompted twice"
            );
            return Err(PaymentServiceError::DepositAlreadyPaid(order_code.to_string()));
        }

        info!(
            order_code = %order.order_code,
            correlation_id = %initiated.correlation_id,
            phone = %mask_phone(&initiated.normalized_phone),
            amount = amount_units,
            provider = self.gateway.name(),
            "Deposit prompt sent"
        );

        Ok(InitiateResponse {
            success: true,
            message: initiated.customer_message,
            checkout_request_id: initiated.correlation_id,
        })
    }

    /// Report the deposit status, asking the gateway only while it is pending.
    pub async fn poll_status(&self, order_code: &str) -> Result<PollResponse, PaymentServiceError> {
        let (order, payment) = self.load(order_code).await?;

        let Some(payment) = payment else {
            return Ok(no_payment(&order));
        };
        let Some(correlation_id) = payment.deposit_correlation_id.clone() else {
            return Ok(no_payment(&order));
        };

        if payment.payment_status().is_terminal() {
            return Ok(PollResponse::from_local(&order, &payment));
        }

        let outcome = match self.query_with_retry(&correlation_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    order_code = %order.order_code,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Status query failed; reporting pending"
                );
                return Ok(PollResponse {
                    success: false,
                    payment_status: PollStatus::Pending,
                    order_status: order.status,
                    message: e.user_message(),
                });
            }
        };

        let result = self.engine.reconcile(&outcome).await?;
        info!(
            order_code = %order.order_code,
            correlation_id = %correlation_id,
            outcome = ?outcome.status,
            result = ?result,
            "Polled payment status reconciled"
        );

        let (order, payment) = self.load(order_code).await?;
        let payment =
            payment.ok_or_else(|| PaymentServiceError::PaymentNotFound(order_code.to_string()))?;
        Ok(PollResponse::from_local(&order, &payment))
    }

    async fn query_with_retry(&self, correlation_id: &str) -> Result<PaymentOutcome, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.gateway.query_status(correlation_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_retryable() && attempt < self.query_max_retries => {
                    attempt += 1;
                    warn!(
                        correlation_id = %correlation_id,
                        attempt = attempt,
                        error = %e,
                        "Retrying status query"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn no_payment(order: &Order) -> PollResponse {
    PollResponse {
        success: true,
        payment_status: PollStatus::NoPayment,
        order_status: order.status.clone(),
        message: "No payment has been started for this order".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(PollStatus::NoPayment).unwrap(),
            serde_json::json!("no_payment")
        );
        assert_eq!(
            serde_json::to_value(PollStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }

    #[test]
    fn error_mapping() {
        let err: AppError = PaymentServiceError::DepositAlreadyPaid("CR-2026-0001".into()).into();
        assert_eq!(err.status_code(), 409);

        let err: AppError = PaymentServiceError::OrderNotFound("CR-2026-0001".into()).into();
        assert_eq!(err.status_code(), 404);

        let err: AppError = PaymentServiceError::OrderClosed {
            order_code: "CR-2026-0001".into(),
            status: "cancelled".into(),
        }
        .into();
        assert_eq!(err.status_code(), 422);

        let err: AppError = PaymentServiceError::Gateway(GatewayError::InvalidPhoneFormat {
            phone: "123".into(),
        })
        .into();
        assert_eq!(err.status_code(), 400);
    }
}
