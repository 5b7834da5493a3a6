//! Reconciliation engine - the single writer of payment settlement state.
//!
//! Webhook callbacks and client polls both land here. Each outcome is
//! applied at most once per correlation id:
//! 1. Unknown correlation id: orphan, logged and dropped
//! 2. Attempt already settled: duplicate, no-op (receipt backfill only)
//! 3. Success: deposit paid, order confirmed, customer notified
//! 4. Failure: payment failed when it is the current attempt, order untouched
//! 5. Unknown result: nothing changes
//!
//! Concurrent deliveries race on a compare-and-set in the repository; only
//! the winner appends history and notifies.

use crate::database::error::DatabaseError;
use crate::database::payment_repository::{
    FailureSettlement, PaymentRepository, PaymentStatus, SettlementResult, SuccessSettlement,
};
use crate::error::AppError;
use crate::payments::types::{OutcomeStatus, PaymentOutcome};
use crate::services::notification::{notify, Notification, NotificationSink};
use crate::services::order_lifecycle::OrderStatus;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What reconciling one outcome did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This outcome changed the payment to the given status
    Applied(PaymentStatus),
    /// The attempt had already been settled
    Duplicate,
    /// No payment carries this correlation id
    Orphaned,
    /// The gateway has no final answer yet
    Unconfirmed,
    /// Failure for an attempt that a newer initiation replaced
    StaleAttempt,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<ReconcileError> for AppError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Database(e) => e.into(),
        }
    }
}

pub struct ReconciliationEngine {
    payments: Arc<dyn PaymentRepository>,
    notifier: Arc<dyn NotificationSink>,
}

impl ReconciliationEngine {
    pub fn new(payments: Arc<dyn PaymentRepository>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { payments, notifier }
    }

    pub async fn reconcile(
        &self,
        outcome: &PaymentOutcome,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match outcome.status {
            OutcomeStatus::Success => self.apply_success(outcome).await,
            OutcomeStatus::Failure => self.apply_failure(outcome).await,
            OutcomeStatus::Unknown => self.note_unknown(outcome).await,
        }
    }

    async fn apply_success(
        &self,
        outcome: &PaymentOutcome,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let history_note = match &outcome.receipt {
            Some(receipt) => format!("Payment confirmed via M-PESA (receipt {})", receipt),
            None => "Payment confirmed via M-PESA".to_string(),
        };

        let settlement = SuccessSettlement {
            correlation_id: outcome.correlation_id.clone(),
            receipt: outcome.receipt.clone(),
            result_code: outcome.result_code.clone(),
            description: outcome.description.clone(),
            paid_at: outcome.received_at,
            history_note,
        };

        match self.payments.settle_success(&settlement).await? {
            SettlementResult::Applied { payment, order } => {
                info!(
                    correlation_id = %outcome.correlation_id,
                    order_code = %order.order_code,
                    source = %outcome.source,
                    receipt = ?payment.deposit_receipt,
                    "Deposit payment confirmed"
                );

                if order.status == OrderStatus::Processing.to_db_status() {
                    notify(
                        self.notifier.as_ref(),
                        Notification::order_confirmed(&order, payment.deposit_receipt.as_deref()),
                    )
                    .await;
                } else {
                    warn!(
                        order_code = %order.order_code,
                        order_status = %order.status,
                        "Deposit received for an order that is no longer pending; refund may be needed"
                    );
                }

                Ok(ReconcileOutcome::Applied(PaymentStatus::Completed))
            }
            SettlementResult::AlreadySettled { payment } => {
                debug!(
                    correlation_id = %outcome.correlation_id,
                    source = %outcome.source,
                    payment_status = %payment.status,
                    "Duplicate payment outcome ignored"
                );
                Ok(ReconcileOutcome::Duplicate)
            }
            SettlementResult::SettledByOtherAttempt { payment } => {
                warn!(
                    correlation_id = %outcome.correlation_id,
                    payment_id = %payment.id,
                    receipt = ?outcome.receipt,
                    "Second successful deposit for an already paid order; refund may be needed"
                );
                Ok(ReconcileOutcome::Duplicate)
            }
            SettlementResult::StaleAttempt { .. } => Ok(ReconcileOutcome::StaleAttempt),
            SettlementResult::NotFound => Ok(self.orphan(outcome)),
        }
    }

    async fn apply_failure(
        &self,
        outcome: &PaymentOutcome,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let reason = if outcome.description.trim().is_empty() {
            format!(
                "M-PESA result code {}",
                outcome.result_code.as_deref().unwrap_or("unknown")
            )
        } else {
            outcome.description.clone()
        };

        let settlement = FailureSettlement {
            correlation_id: outcome.correlation_id.clone(),
            result_code: outcome.result_code.clone(),
            history_note: format!("M-PESA payment failed: {}", reason),
            reason,
        };

        match self.payments.settle_failure(&settlement).await? {
            SettlementResult::Applied { order, .. } => {
                info!(
                    correlation_id = %outcome.correlation_id,
                    order_code = %order.order_code,
                    source = %outcome.source,
                    result_code = ?outcome.result_code,
                    "Deposit payment failed"
                );
                Ok(ReconcileOutcome::Applied(PaymentStatus::Failed))
            }
            SettlementResult::AlreadySettled { .. }
            | SettlementResult::SettledByOtherAttempt { .. } => {
                debug!(
                    correlation_id = %outcome.correlation_id,
                    source = %outcome.source,
                    "Duplicate payment outcome ignored"
                );
                Ok(ReconcileOutcome::Duplicate)
            }
            SettlementResult::StaleAttempt { payment } => {
                info!(
                    correlation_id = %outcome.correlation_id,
                    current_correlation_id = ?payment.deposit_correlation_id,
                    "Failure for a superseded payment attempt recorded"
                );
                Ok(ReconcileOutcome::StaleAttempt)
            }
            SettlementResult::NotFound => Ok(self.orphan(outcome)),
        }
    }

    async fn note_unknown(
        &self,
        outcome: &PaymentOutcome,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if self
            .payments
            .find_attempt(&outcome.correlation_id)
            .await?
            .is_none()
        {
            return Ok(self.orphan(outcome));
        }

        debug!(
            correlation_id = %outcome.correlation_id,
            source = %outcome.source,
            result_code = ?outcome.result_code,
            description = %outcome.description,
            "Payment outcome not final yet"
        );
        Ok(ReconcileOutcome::Unconfirmed)
    }

    fn orphan(&self, outcome: &PaymentOutcome) -> ReconcileOutcome {
        warn!(
            correlation_id = %outcome.correlation_id,
            source = %outcome.source,
            result_code = ?outcome.result_code,
            "Payment outcome for unknown correlation id discarded"
        );
        ReconcileOutcome::Orphaned
    }
}
