use crate::database::error::DatabaseError;
use crate::database::order_repository::{append_history, Order, ORDER_COLUMNS};
use async_trait::async_trait;
use bigdecimal::{BigDecimal, RoundingMode, Zero};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::fmt;
use uuid::Uuid;

/// Aggregate payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deposit/balance split of an order total
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSplit {
    pub deposit: BigDecimal,
    pub balance: BigDecimal,
}

impl PaymentSplit {
    /// 20% deposit rounded half-up to cents; the balance absorbs the remainder
    /// so both parts always add up to `total`.
    pub fn from_total(total: &BigDecimal) -> Self {
        let deposit = (total * BigDecimal::from(20) / BigDecimal::from(100))
            .with_scale_round(2, RoundingMode::HalfUp);
        let balance = total - &deposit;
        Self { deposit, balance }
    }
}

/// Payment entity, one per order
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub deposit_amount: BigDecimal,
    pub deposit_paid: bool,
    pub deposit_paid_at: Option<DateTime<Utc>>,
    pub deposit_receipt: Option<String>,
    /// CheckoutRequestID of the latest prompt
    pub deposit_correlation_id: Option<String>,
    pub deposit_phone: Option<String>,
    pub balance_amount: BigDecimal,
    pub balance_paid: bool,
    pub status: String,
    pub failure_reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn payment_status(&self) -> PaymentStatus {
        // the column carries a CHECK constraint on these three values
        PaymentStatus::from_db(&self.status).unwrap_or(PaymentStatus::Pending)
    }

    pub fn total_paid(&self) -> BigDecimal {
        let mut paid = BigDecimal::zero();
        if self.deposit_paid {
            paid += &self.deposit_amount;
        }
        if self.balance_paid {
            paid += &self.balance_amount;
        }
        paid
    }

    pub fn is_fully_paid(&self) -> bool {
        self.deposit_paid && self.balance_paid
    }

    pub fn remaining_balance(&self) -> BigDecimal {
        (&self.deposit_amount + &self.balance_amount) - self.total_paid()
    }
}

/// One STK prompt; a payment accumulates one row per initiation
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PaymentAttempt {
    pub correlation_id: String,
    pub payment_id: Uuid,
    pub phone: String,
    pub amount_units: i64,
    pub status: String,
    pub result_code: Option<String>,
    pub result_desc: Option<String>,
    pub receipt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub correlation_id: String,
    pub phone: String,
    pub amount_units: i64,
}

#[derive(Debug, Clone)]
pub struct SuccessSettlement {
    pub correlation_id: String,
    pub receipt: Option<String>,
    pub result_code: Option<String>,
    pub description: String,
    pub paid_at: DateTime<Utc>,
    pub history_note: String,
}

#[derive(Debug, Clone)]
pub struct FailureSettlement {
    pub correlation_id: String,
    pub result_code: Option<String>,
    pub reason: String,
    pub history_note: String,
}

/// What a settlement did to the stored state
#[derive(Debug, Clone)]
pub enum SettlementResult {
    /// This call won the compare-and-set
    Applied { payment: Payment, order: Order },
    /// Attempt was already terminal; nothing changed apart from a receipt backfill
    AlreadySettled { payment: Payment },
    /// Attempt succeeded but the deposit had been settled by a different attempt
    SettledByOtherAttempt { payment: Payment },
    /// Failure for an attempt that is no longer the payment's current one
    StaleAttempt { payment: Payment },
    NotFound,
}

pub(crate) const PAYMENT_COLUMNS: &str = "id, order_id, deposit_amount, deposit_paid, deposit_paid_at, deposit_receipt, \
     deposit_correlation_id, deposit_phone, balance_amount, balance_paid, status, failure_reason, notes, \
     created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "correlation_id, payment_id, phone, amount_units, status, result_code, result_desc, \
     receipt, created_at, settled_at";

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    /// Resolve a payment through any of its attempts
    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn find_attempt(
        &self,
        correlation_id: &str,
    ) -> Result<Option<PaymentAttempt>, DatabaseError>;

    /// Point the payment at a new attempt and reset it to pending.
    ///
    /// Returns `None` when the deposit is already completed.
    async fn record_initiation(
        &self,
        payment_id: Uuid,
        attempt: &NewAttempt,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Mark the attempt and deposit paid; move the order out of `pending`.
    async fn settle_success(
        &self,
        settlement: &SuccessSettlement,
    ) -> Result<SettlementResult, DatabaseError>;

    /// Mark the attempt failed; fail the payment only if it is the current attempt.
    async fn settle_failure(
        &self,
        settlement: &FailureSettlement,
    ) -> Result<SettlementResult, DatabaseError>;
}

pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn payment_by_id(
    tx: &mut Transaction<'_, Postgres>,
    payment_id: Uuid,
) -> Result<Payment, DatabaseError> {
    sqlx::query_as::<_, Payment>(&format!(
        "SELECT {} FROM payments WHERE id = $1",
        PAYMENT_COLUMNS
    ))
    .bind(payment_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("Payment", payment_id))
}

async fn attempt_by_id(
    tx: &mut Transaction<'_, Postgres>,
    correlation_id: &str,
) -> Result<Option<PaymentAttempt>, DatabaseError> {
    sqlx::query_as::<_, PaymentAttempt>(&format!(
        "SELECT {} FROM payment_attempts WHERE correlation_id = $1",
        ATTEMPT_COLUMNS
    ))
    .bind(correlation_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(DatabaseError::from_sqlx)
}

async fn order_by_id(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
) -> Result<Order, DatabaseError> {
    sqlx::query_as::<_, Order>(&format!(
        "SELECT {} FROM orders WHERE id = $1 FOR UPDATE",
        ORDER_COLUMNS
    ))
    .bind(order_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(DatabaseError::from_sqlx)?
    .ok_or_else(|| DatabaseError::not_found("Order", order_id))
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE order_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments \
             WHERE id = (SELECT payment_id FROM payment_attempts WHERE correlation_id = $1)",
            PAYMENT_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_attempt(
        &self,
        correlation_id: &str,
    ) -> Result<Option<PaymentAttempt>, DatabaseError> {
        sqlx::query_as::<_, PaymentAttempt>(&format!(
            "SELECT {} FROM payment_attempts WHERE correlation_id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn record_initiation(
        &self,
        payment_id: Uuid,
        attempt: &NewAttempt,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "UPDATE payments \
             SET deposit_correlation_id = $2, deposit_phone = $3, status = 'pending', \
                 failure_reason = NULL, updated_at = NOW() \
             WHERE id = $1 AND status <> 'completed' \
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(&attempt.correlation_id)
        .bind(&attempt.phone)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(payment) = payment else {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(None);
        };

        sqlx::query(
            "INSERT INTO payment_attempts (correlation_id, payment_id, phone, amount_units) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&attempt.correlation_id)
        .bind(payment_id)
        .bind(&attempt.phone)
        .bind(attempt.amount_units)
        .execute(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(Some(payment))
    }

    async fn settle_success(
        &self,
        settlement: &SuccessSettlement,
    ) -> Result<SettlementResult, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let won = sqlx::query_as::<_, PaymentAttempt>(&format!(
            "UPDATE payment_attempts \
             SET status = 'completed', result_code = $2, result_desc = $3, receipt = $4, settled_at = NOW() \
             WHERE correlation_id = $1 AND status = 'pending' \
             RETURNING {}",
            ATTEMPT_COLUMNS
        ))
        .bind(&settlement.correlation_id)
        .bind(&settlement.result_code)
        .bind(&settlement.description)
        .bind(&settlement.receipt)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(attempt) = won else {
            let Some(existing) = attempt_by_id(&mut tx, &settlement.correlation_id).await? else {
                tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
                return Ok(SettlementResult::NotFound);
            };

            let mut payment = payment_by_id(&mut tx, existing.payment_id).await?;
            if existing.status == "completed" {
                if let Some(receipt) = &settlement.receipt {
                    sqlx::query(
                        "UPDATE payment_attempts SET receipt = $2 \
                         WHERE correlation_id = $1 AND receipt IS NULL",
                    )
                    .bind(&settlement.correlation_id)
                    .bind(receipt)
                    .execute(&mut *tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?;

                    if let Some(backfilled) = sqlx::query_as::<_, Payment>(&format!(
                        "UPDATE payments SET deposit_receipt = $3, updated_at = NOW() \
                         WHERE id = $1 AND deposit_correlation_id = $2 \
                           AND status = 'completed' AND deposit_receipt IS NULL \
                         RETURNING {}",
                        PAYMENT_COLUMNS
                    ))
                    .bind(payment.id)
                    .bind(&settlement.correlation_id)
                    .bind(receipt)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(DatabaseError::from_sqlx)?
                    {
                        payment = backfilled;
                    }
                }
            }

            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(SettlementResult::AlreadySettled { payment });
        };

        let settled = sqlx::query_as::<_, Payment>(&format!(
            "UPDATE payments \
             SET status = 'completed', deposit_paid = TRUE, deposit_paid_at = $2, \
                 deposit_receipt = COALESCE($3, deposit_receipt), deposit_correlation_id = $4, \
                 failure_reason = NULL, updated_at = NOW() \
             WHERE id = $1 AND status IN ('pending', 'failed') \
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(attempt.payment_id)
        .bind(settlement.paid_at)
        .bind(&settlement.receipt)
        .bind(&settlement.correlation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(payment) = settled else {
            let payment = payment_by_id(&mut tx, attempt.payment_id).await?;
            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(SettlementResult::SettledByOtherAttempt { payment });
        };

        let moved = sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders SET status = 'processing', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' \
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(payment.order_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let order = match moved {
            Some(order) => order,
            None => order_by_id(&mut tx, payment.order_id).await?,
        };

        append_history(&mut tx, order.id, &order.status, &settlement.history_note).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(SettlementResult::Applied { payment, order })
    }

    async fn settle_failure(
        &self,
        settlement: &FailureSettlement,
    ) -> Result<SettlementResult, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let won = sqlx::query_as::<_, PaymentAttempt>(&format!(
            "UPDATE payment_attempts \
             SET status = 'failed', result_code = $2, result_desc = $3, settled_at = NOW() \
             WHERE correlation_id = $1 AND status = 'pending' \
             RETURNING {}",
            ATTEMPT_COLUMNS
        ))
        .bind(&settlement.correlation_id)
        .bind(&settlement.result_code)
        .bind(&settlement.reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(attempt) = won else {
            let result = match attempt_by_id(&mut tx, &settlement.correlation_id).await? {
                Some(existing) => SettlementResult::AlreadySettled {
                    payment: payment_by_id(&mut tx, existing.payment_id).await?,
                },
                None => SettlementResult::NotFound,
            };
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(result);
        };

        let failed = sqlx::query_as::<_, Payment>(&format!(
            "UPDATE payments SET status = 'failed', failure_reason = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' AND deposit_correlation_id = $2 \
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(attempt.payment_id)
        .bind(&settlement.correlation_id)
        .bind(&settlement.reason)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(payment) = failed else {
            let payment = payment_by_id(&mut tx, attempt.payment_id).await?;
            tx.commit().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(SettlementResult::StaleAttempt { payment });
        };

        let order = order_by_id(&mut tx, payment.order_id).await?;
        append_history(&mut tx, order.id, &order.status, &settlement.history_note).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(SettlementResult::Applied { payment, order })
    }
}
