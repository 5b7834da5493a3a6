use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DeliveryConfirmation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SellerReview {
    pub id: Uuid,
    pub seller_id: Uuid,
    /// Customer user id, or lowercased email for guest checkouts
    pub customer_ref: String,
    pub order_id: Uuid,
    pub rating: i16,
    pub title: String,
    pub comment: String,
    pub is_verified_purchase: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReviewInput {
    pub seller_id: Uuid,
    pub customer_ref: String,
    pub order_id: Uuid,
    pub rating: i16,
    pub title: String,
    pub comment: String,
}

#[derive(FromRow)]
struct UpsertedReview {
    #[sqlx(flatten)]
    review: SellerReview,
    inserted: bool,
}

const CONFIRMATION_COLUMNS: &str = "id, order_id, confirmed, confirmed_at, note, created_at";

const REVIEW_COLUMNS: &str = "id, seller_id, customer_ref, order_id, rating, title, comment, \
     is_verified_purchase, created_at, updated_at";

#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn find_confirmation(
        &self,
        order_id: Uuid,
    ) -> Result<Option<DeliveryConfirmation>, DatabaseError>;

    /// Confirm delivery, creating the record on first use.
    ///
    /// The flag is `true` only for the call that flipped `confirmed`.
    async fn confirm_delivery(
        &self,
        order_id: Uuid,
        note: Option<&str>,
    ) -> Result<(DeliveryConfirmation, bool), DatabaseError>;

    /// Insert or update the review keyed on (seller, customer, order).
    ///
    /// The flag is `true` when a new review was created.
    async fn upsert_review(&self, input: &ReviewInput)
        -> Result<(SellerReview, bool), DatabaseError>;
}

pub struct PgDeliveryRepository {
    pool: PgPool,
}

impl PgDeliveryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryRepository for PgDeliveryRepository {
    async fn find_confirmation(
        &self,
        order_id: Uuid,
    ) -> Result<Option<DeliveryConfirmation>, DatabaseError> {
        sqlx::query_as::<_, DeliveryConfirmation>(&format!(
            "SELECT {} FROM delivery_confirmations WHERE order_id = $1",
            CONFIRMATION_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn confirm_delivery(
        &self,
        order_id: Uuid,
        note: Option<&str>,
    ) -> Result<(DeliveryConfirmation, bool), DatabaseError> {
        let flipped = sqlx::query_as::<_, DeliveryConfirmation>(&format!(
            "INSERT INTO delivery_confirmations (order_id, confirmed, confirmed_at, note) \
             VALUES ($1, TRUE, NOW(), $2) \
             ON CONFLICT (order_id) DO UPDATE \
             SET confirmed = TRUE, confirmed_at = NOW(), \
                 note = COALESCE(EXCLUDED.note, delivery_confirmations.note) \
             WHERE delivery_confirmations.confirmed = FALSE \
             RETURNING {}",
            CONFIRMATION_COLUMNS
        ))
        .bind(order_id)
        .bind(note)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if let Some(confirmation) = flipped {
            return Ok((confirmation, true));
        }

        let existing = self
            .find_confirmation(order_id)
            .await?
            .ok_or_else(|| DatabaseError::not_found("DeliveryConfirmation", order_id))?;
        Ok((existing, false))
    }

    async fn upsert_review(
        &self,
        input: &ReviewInput,
    ) -> Result<(SellerReview, bool), DatabaseError> {
        let row = sqlx::query_as::<_, UpsertedReview>(&format!(
            "INSERT INTO seller_reviews \
                 (seller_id, customer_ref, order_id, rating, title, comment, is_verified_purchase) \
             VALUES ($1, $2, $3, $4, $5, $6, TRUE) \
             ON CONFLICT (seller_id, customer_ref, order_id) DO UPDATE \
             SET rating = EXCLUDED.rating, title = EXCLUDED.title, comment = EXCLUDED.comment, \
                 updated_at = NOW() \
             RETURNING {}, (xmax = 0) AS inserted",
            REVIEW_COLUMNS
        ))
        .bind(input.seller_id)
        .bind(&input.customer_ref)
        .bind(input.order_id)
        .bind(input.rating)
        .bind(&input.title)
        .bind(&input.comment)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok((row.review, row.inserted))
    }
}
