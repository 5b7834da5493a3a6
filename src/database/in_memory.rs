use crate::database::delivery_repository::{
    DeliveryConfirmation, DeliveryRepository, ReviewInput, SellerReview,
};
use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::order_repository::{
    NewOrder, Order, OrderItem, OrderRepository, StatusHistoryEntry,
};
use crate::database::payment_repository::{
    FailureSettlement, NewAttempt, Payment, PaymentAttempt, PaymentRepository, PaymentSplit,
    PaymentStatus, SettlementResult, SuccessSettlement,
};
use crate::services::order_lifecycle::OrderStatus;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    orders: HashMap<Uuid, Order>,
    order_codes: HashMap<String, Uuid>,
    items: Vec<OrderItem>,
    history: Vec<StatusHistoryEntry>,
    next_history_id: i64,
    payments: HashMap<Uuid, Payment>,
    attempts: HashMap<String, PaymentAttempt>,
    confirmations: HashMap<Uuid, DeliveryConfirmation>,
    reviews: Vec<SellerReview>,
}

impl MemoryState {
    fn append_history(&mut self, order_id: Uuid, status: &str, note: &str) {
        self.next_history_id += 1;
        self.history.push(StatusHistoryEntry {
            id: self.next_history_id,
            order_id,
            status: status.to_string(),
            note: note.to_string(),
            created_at: Utc::now(),
        });
    }

    fn payment(&self, payment_id: Uuid) -> Result<Payment, DatabaseError> {
        self.payments
            .get(&payment_id)
            .cloned()
            .ok_or_else(|| DatabaseError::not_found("Payment", payment_id))
    }

    fn order_mut(&mut self, order_id: Uuid) -> Result<&mut Order, DatabaseError> {
        self.orders
            .get_mut(&order_id)
            .ok_or_else(|| DatabaseError::not_found("Order", order_id))
    }
}

/// Process-local store implementing every repository trait.
///
/// One mutex guards all state, so each call observes and mutates a
/// consistent snapshot the way a database transaction would.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn create_order(
        &self,
        new_order: &NewOrder,
        split: &PaymentSplit,
        initial_note: &str,
    ) -> Result<(Order, Payment), DatabaseError> {
        let mut state = self.state.lock().await;
        if state.order_codes.contains_key(&new_order.order_code) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "orders_order_code_key".to_string(),
            }));
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            order_code: new_order.order_code.clone(),
            customer_id: new_order.customer_id,
            customer_name: new_order.customer_name.clone(),
            customer_email: new_order.customer_email.clone(),
            customer_phone: new_order.customer_phone.clone(),
            delivery_address: new_order.delivery_address.clone(),
            delivery_notes: new_order.delivery_notes.clone(),
            total_amount: new_order.total_amount.clone(),
            status: OrderStatus::Pending.to_db_status().to_string(),
            created_at: now,
            updated_at: now,
        };

        for item in &new_order.items {
            state.items.push(OrderItem {
                id: Uuid::new_v4(),
                order_id: order.id,
                product_id: item.product_id,
                product_name: item.product_name.clone(),
                unit_price: item.unit_price.clone(),
                quantity: item.quantity,
                seller_id: item.seller_id,
            });
        }

        let payment = Payment {
            id: Uuid::new_v4(),
            order_id: order.id,
            deposit_amount: split.deposit.clone(),
            deposit_paid: false,
            deposit_paid_at: None,
            deposit_receipt: None,
            deposit_correlation_id: None,
            deposit_phone: None,
            balance_amount: split.balance.clone(),
            balance_paid: false,
            status: PaymentStatus::Pending.as_str().to_string(),
            failure_reason: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };

        state.append_history(order.id, &order.status, initial_note);
        state.order_codes.insert(order.order_code.clone(), order.id);
        state.orders.insert(order.id, order.clone());
        state.payments.insert(payment.id, payment.clone());

        Ok((order, payment))
    }

    async fn find_by_code(&self, order_code: &str) -> Result<Option<Order>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .order_codes
            .get(order_code)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }

    async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&order_id).cloned())
    }

    async fn items_for_order(&self, order_id: Uuid) -> Result<Vec<OrderItem>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn sellers_for_order(&self, order_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        let state = self.state.lock().await;
        let mut sellers: Vec<Uuid> = state
            .items
            .iter()
            .filter(|item| item.order_id == order_id)
            .map(|item| item.seller_id)
            .collect();
        sellers.sort();
        sellers.dedup();
        Ok(sellers)
    }

    async fn status_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<StatusHistoryEntry>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: &str,
        to: &str,
        note: &str,
    ) -> Result<Option<Order>, DatabaseError> {
        let mut state = self.state.lock().await;
        let order = state.order_mut(order_id)?;
        if order.status != from {
            return Ok(None);
        }

        order.status = to.to_string();
        order.updated_at = Utc::now();
        let updated = order.clone();
        state.append_history(order_id, to, note);

        Ok(Some(updated))
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn find_by_order(&self, order_id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .get(correlation_id)
            .and_then(|attempt| state.payments.get(&attempt.payment_id))
            .cloned())
    }

    async fn find_attempt(
        &self,
        correlation_id: &str,
    ) -> Result<Option<PaymentAttempt>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state.attempts.get(correlation_id).cloned())
    }

    async fn record_initiation(
        &self,
        payment_id: Uuid,
        attempt: &NewAttempt,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut state = self.state.lock().await;
        if state.attempts.contains_key(&attempt.correlation_id) {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "payment_attempts_pkey".to_string(),
            }));
        }

        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| DatabaseError::not_found("Payment", payment_id))?;
        if payment.payment_status() == PaymentStatus::Completed {
            return Ok(None);
        }

        payment.deposit_correlation_id = Some(attempt.correlation_id.clone());
        payment.deposit_phone = Some(attempt.phone.clone());
        payment.status = PaymentStatus::Pending.as_str().to_string();
        payment.failure_reason = None;
        payment.updated_at = Utc::now();
        let updated = payment.clone();

        state.attempts.insert(
            attempt.correlation_id.clone(),
            PaymentAttempt {
                correlation_id: attempt.correlation_id.clone(),
                payment_id,
                phone: attempt.phone.clone(),
                amount_units: attempt.amount_units,
                status: PaymentStatus::Pending.as_str().to_string(),
                result_code: None,
                result_desc: None,
                receipt: None,
                created_at: Utc::now(),
                settled_at: None,
            },
        );

        Ok(Some(updated))
    }

    async fn settle_success(
        &self,
        settlement: &SuccessSettlement,
    ) -> Result<SettlementResult, DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let Some(attempt) = state.attempts.get_mut(&settlement.correlation_id) else {
            return Ok(SettlementResult::NotFound);
        };

        if attempt.status != PaymentStatus::Pending.as_str() {
            let payment_id = attempt.payment_id;
            let completed = attempt.status == PaymentStatus::Completed.as_str();
            if completed && attempt.receipt.is_none() {
                attempt.receipt = settlement.receipt.clone();
            }

            if completed && settlement.receipt.is_some() {
                if let Some(payment) = state.payments.get_mut(&payment_id) {
                    if payment.payment_status() == PaymentStatus::Completed
                        && payment.deposit_receipt.is_none()
                        && payment.deposit_correlation_id.as_deref()
                            == Some(settlement.correlation_id.as_str())
                    {
                        payment.deposit_receipt = settlement.receipt.clone();
                        payment.updated_at = now;
                    }
                }
            }

            return Ok(SettlementResult::AlreadySettled {
                payment: state.payment(payment_id)?,
            });
        }

        attempt.status = PaymentStatus::Completed.as_str().to_string();
        attempt.result_code = settlement.result_code.clone();
        attempt.result_desc = Some(settlement.description.clone());
        attempt.receipt = settlement.receipt.clone();
        attempt.settled_at = Some(now);
        let payment_id = attempt.payment_id;

        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| DatabaseError::not_found("Payment", payment_id))?;
        if payment.payment_status() == PaymentStatus::Completed {
            return Ok(SettlementResult::SettledByOtherAttempt {
                payment: payment.clone(),
            });
        }

        payment.status = PaymentStatus::Completed.as_str().to_string();
        payment.deposit_paid = true;
        payment.deposit_paid_at = Some(settlement.paid_at);
        if settlement.receipt.is_some() {
            payment.deposit_receipt = settlement.receipt.clone();
        }
        payment.deposit_correlation_id = Some(settlement.correlation_id.clone());
        payment.failure_reason = None;
        payment.updated_at = now;
        let payment = payment.clone();

        let order = state.order_mut(payment.order_id)?;
        if order.status == OrderStatus::Pending.to_db_status() {
            order.status = OrderStatus::Processing.to_db_status().to_string();
            order.updated_at = now;
        }
        let order = order.clone();
        state.append_history(order.id, &order.status, &settlement.history_note);

        Ok(SettlementResult::Applied { payment, order })
    }

    async fn settle_failure(
        &self,
        settlement: &FailureSettlement,
    ) -> Result<SettlementResult, DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let Some(attempt) = state.attempts.get_mut(&settlement.correlation_id) else {
            return Ok(SettlementResult::NotFound);
        };

        let payment_id = attempt.payment_id;
        if attempt.status != PaymentStatus::Pending.as_str() {
            return Ok(SettlementResult::AlreadySettled {
                payment: state.payment(payment_id)?,
            });
        }

        attempt.status = PaymentStatus::Failed.as_str().to_string();
        attempt.result_code = settlement.result_code.clone();
        attempt.result_desc = Some(settlement.reason.clone());
        attempt.settled_at = Some(now);

        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| DatabaseError::not_found("Payment", payment_id))?;
        let is_current =
            payment.deposit_correlation_id.as_deref() == Some(settlement.correlation_id.as_str());
        if !is_current || payment.payment_status() != PaymentStatus::Pending {
            return Ok(SettlementResult::StaleAttempt {
                payment: payment.clone(),
            });
        }

        payment.status = PaymentStatus::Failed.as_str().to_string();
        payment.failure_reason = Some(settlement.reason.clone());
        payment.updated_at = now;
        let payment = payment.clone();

        let order = state
            .orders
            .get(&payment.order_id)
            .cloned()
            .ok_or_else(|| DatabaseError::not_found("Order", payment.order_id))?;
        state.append_history(order.id, &order.status, &settlement.history_note);

        Ok(SettlementResult::Applied { payment, order })
    }
}

#[async_trait]
impl DeliveryRepository for InMemoryStore {
    async fn find_confirmation(
        &self,
        order_id: Uuid,
    ) -> Result<Option<DeliveryConfirmation>, DatabaseError> {
        let state = self.state.lock().await;
        Ok(state.confirmations.get(&order_id).cloned())
    }

    async fn confirm_delivery(
        &self,
        order_id: Uuid,
        note: Option<&str>,
    ) -> Result<(DeliveryConfirmation, bool), DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let confirmation = state
            .confirmations
            .entry(order_id)
            .or_insert_with(|| DeliveryConfirmation {
                id: Uuid::new_v4(),
                order_id,
                confirmed: false,
                confirmed_at: None,
                note: None,
                created_at: now,
            });

        if confirmation.confirmed {
            return Ok((confirmation.clone(), false));
        }

        confirmation.confirmed = true;
        confirmation.confirmed_at = Some(now);
        if let Some(note) = note {
            confirmation.note = Some(note.to_string());
        }
        Ok((confirmation.clone(), true))
    }

    async fn upsert_review(
        &self,
        input: &ReviewInput,
    ) -> Result<(SellerReview, bool), DatabaseError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(existing) = state.reviews.iter_mut().find(|r| {
            r.seller_id == input.seller_id
                && r.customer_ref == input.customer_ref
                && r.order_id == input.order_id
        }) {
            existing.rating = input.rating;
            existing.title = input.title.clone();
            existing.comment = input.comment.clone();
            existing.updated_at = now;
            return Ok((existing.clone(), false));
        }

        let review = SellerReview {
            id: Uuid::new_v4(),
            seller_id: input.seller_id,
            customer_ref: input.customer_ref.clone(),
            order_id: input.order_id,
            rating: input.rating,
            title: input.title.clone(),
            comment: input.comment.clone(),
            is_verified_purchase: true,
            created_at: now,
            updated_at: now,
        };
        state.reviews.push(review.clone());
        Ok((review, true))
    }
}
