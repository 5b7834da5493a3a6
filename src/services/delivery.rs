//! Delivery confirmation and seller reviews
//!
//! A customer confirms delivery once the seller marks the order delivered;
//! only then can they review the sellers on that order.

use crate::database::delivery_repository::{
    DeliveryConfirmation, DeliveryRepository, ReviewInput, SellerReview,
};
use crate::database::error::DatabaseError;
use crate::database::order_repository::{Order, OrderRepository};
use crate::error::{AppError, DomainError, ValidationError};
use crate::services::notification::{notify, Notification, NotificationSink};
use crate::services::order_lifecycle::OrderStatus;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MIN_RATING: i16 = 1;
const MAX_RATING: i16 = 5;
const MAX_TITLE_LEN: usize = 200;

/// Caller identity as forwarded by the upstream auth layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerIdentity {
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
}

impl CustomerIdentity {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.email.as_deref().map_or(true, |e| e.trim().is_empty())
    }

    /// Registered orders match on user id, guest orders on contact email
    pub fn owns(&self, order: &Order) -> bool {
        match order.customer_id {
            Some(customer_id) => self.user_id == Some(customer_id),
            None => self
                .email
                .as_deref()
                .is_some_and(|e| e.trim().eq_ignore_ascii_case(order.customer_email.trim())),
        }
    }

    /// Key reviews are stored under
    fn customer_ref(&self, order: &Order) -> String {
        match (order.customer_id, self.user_id) {
            (Some(_), Some(user_id)) => user_id.to_string(),
            _ => order.customer_email.trim().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    #[serde(default)]
    pub seller_id: Option<Uuid>,
    pub rating: i16,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("no customer identity on request")]
    MissingIdentity,

    #[error("caller is not the customer of order {0}")]
    NotCustomer(String),

    #[error("order {order_code} is {status}, not delivered")]
    NotDelivered { order_code: String, status: String },

    #[error("delivery of order {0} not confirmed")]
    NotConfirmed(String),

    #[error("rating {0} outside 1-5")]
    InvalidRating(i16),

    #[error("seller {seller_id} has no items on order {order_code}")]
    SellerNotOnOrder { order_code: String, seller_id: Uuid },

    #[error("order {0} has several sellers; choose one to review")]
    SellerRequired(String),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<DeliveryError> for AppError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::OrderNotFound(order_code) => {
                AppError::domain(DomainError::OrderNotFound { order_code })
            }
            DeliveryError::MissingIdentity => AppError::validation(ValidationError::MissingIdentity),
            DeliveryError::NotCustomer(order_code) => {
                AppError::domain(DomainError::NotOrderCustomer { order_code })
            }
            DeliveryError::NotDelivered { order_code, status } => {
                AppError::domain(DomainError::OrderNotDelivered { order_code, status })
            }
            DeliveryError::NotConfirmed(order_code) => {
                AppError::domain(DomainError::DeliveryNotConfirmed { order_code })
            }
            DeliveryError::InvalidRating(_) => AppError::validation(ValidationError::OutOfRange {
                field: "rating".to_string(),
                min: Some(MIN_RATING.to_string()),
                max: Some(MAX_RATING.to_string()),
            }),
            DeliveryError::SellerNotOnOrder { seller_id, .. } => {
                AppError::validation(ValidationError::InvalidField {
                    field: "seller_id".to_string(),
                    reason: format!("seller {} has no items on this order", seller_id),
                })
            }
            DeliveryError::SellerRequired(_) => AppError::validation(ValidationError::MissingField {
                field: "seller_id".to_string(),
            }),
            DeliveryError::InvalidField { field, reason } => {
                AppError::validation(ValidationError::InvalidField { field, reason })
            }
            DeliveryError::Database(e) => e.into(),
        }
    }
}

pub struct DeliveryService {
    orders: Arc<dyn OrderRepository>,
    deliveries: Arc<dyn DeliveryRepository>,
    notifier: Arc<dyn NotificationSink>,
}

impl DeliveryService {
    pub fn new(
        orders: Arc<dyn OrderRepository>,
        deliveries: Arc<dyn DeliveryRepository>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            orders,
            deliveries,
            notifier,
        }
    }

    async fn owned_order(
        &self,
        order_code: &str,
        identity: &CustomerIdentity,
    ) -> Result<Order, DeliveryError> {
        if identity.is_empty() {
            return Err(DeliveryError::MissingIdentity);
        }

        let order = self
            .orders
            .find_by_code(order_code)
            .await?
            .ok_or_else(|| DeliveryError::OrderNotFound(order_code.to_string()))?;

        if !identity.owns(&order) {
            warn!(order_code = %order_code, "Delivery action by non-customer rejected");
            return Err(DeliveryError::NotCustomer(order_code.to_string()));
        }
        Ok(order)
    }

    /// Confirm receipt of a delivered order. Repeating it is a no-op.
    pub async fn confirm_delivery(
        &self,
        order_code: &str,
        identity: &CustomerIdentity,
        note: Option<&str>,
    ) -> Result<DeliveryConfirmation, DeliveryError> {
        let order = self.owned_order(order_code, identity).await?;

        if order.status != OrderStatus::Delivered.to_db_status() {
            return Err(DeliveryError::NotDelivered {
                order_code: order_code.to_string(),
                status: order.status,
            });
        }

        let note = note.map(str::trim).filter(|n| !n.is_empty());
        let (confirmation, newly_confirmed) =
            self.deliveries.confirm_delivery(order.id, note).await?;

        if newly_confirmed {
            info!(order_code = %order_code, "Delivery confirmed by customer");
            let sellers = self.orders.sellers_for_order(order.id).await?;
            join_all(sellers.into_iter().map(|seller_id| {
                notify(
                    self.notifier.as_ref(),
                    Notification::delivery_confirmed(&order, seller_id),
                )
            }))
            .await;
        }

        Ok(confirmation)
    }

    /// Create or update the caller's review of a seller on this order.
    pub async fn submit_review(
        &self,
        order_code: &str,
        identity: &CustomerIdentity,
        request: &ReviewRequest,
    ) -> Result<SellerReview, DeliveryError> {
        if !(MIN_RATING..=MAX_RATING).contains(&request.rating) {
            return Err(DeliveryError::InvalidRating(request.rating));
        }
        let title = request.title.trim();
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(DeliveryError::InvalidField {
                field: "title".to_string(),
                reason: format!("must be at most {} characters", MAX_TITLE_LEN),
            });
        }

        let order = self.owned_order(order_code, identity).await?;

        let confirmed = self
            .deliveries
            .find_confirmation(order.id)
            .await?
            .is_some_and(|c| c.confirmed);
        if !confirmed {
            return Err(DeliveryError::NotConfirmed(order_code.to_string()));
        }

        let sellers = self.orders.sellers_for_order(order.id).await?;
        let seller_id = match (request.seller_id, sellers.as_slice()) {
            (Some(seller_id), _) if sellers.contains(&seller_id) => seller_id,
            (Some(seller_id), _) => {
                return Err(DeliveryError::SellerNotOnOrder {
                    order_code: order_code.to_string(),
                    seller_id,
                })
            }
            (None, [only]) => *only,
            (None, _) => return Err(DeliveryError::SellerRequired(order_code.to_string())),
        };

        let input = ReviewInput {
            seller_id,
            customer_ref: identity.customer_ref(&order),
            order_id: order.id,
            rating: request.rating,
            title: title.to_string(),
            comment: request.comment.trim().to_string(),
        };
        let (review, created) = self.deliveries.upsert_review(&input).await?;

        info!(
            order_code = %order_code,
            seller_id = %seller_id,
            rating = review.rating,
            created = created,
            "Seller review saved"
        );

        if created {
            notify(
                self.notifier.as_ref(),
                Notification::review_received(&order, seller_id, review.rating),
            )
            .await;
        }

        Ok(review)
    }
}
