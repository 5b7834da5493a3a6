use crate::database::error::DatabaseError;
use crate::database::payment_repository::{Payment, PaymentSplit, PAYMENT_COLUMNS};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Order entity
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub order_code: String,
    pub customer_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub delivery_notes: Option<String>,
    pub total_amount: BigDecimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Line captured at checkout; price and seller are frozen at that moment
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
    pub seller_id: Uuid,
}

impl OrderItem {
    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

/// Append-only status log entry
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatusHistoryEntry {
    pub id: i64,
    pub order_id: Uuid,
    pub status: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
    pub seller_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_code: String,
    pub customer_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
    pub delivery_address: String,
    pub delivery_notes: Option<String>,
    pub total_amount: BigDecimal,
    pub items: Vec<NewOrderItem>,
}

pub(crate) const ORDER_COLUMNS: &str = "id, order_code, customer_id, customer_name, customer_email, customer_phone, \
     delivery_address, delivery_notes, total_amount, status, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, product_id, product_name, unit_price, quantity, seller_id";

const HISTORY_COLUMNS: &str = "id, order_id, status, note, created_at";

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist order, items, payment split and the first history entry atomically.
    ///
    /// A clashing `order_code` surfaces as a unique violation.
    async fn create_order(
        &self,
        order: &NewOrder,
        split: &PaymentSplit,
        initial_note: &str,
    ) -> Result<(Order, Payment), DatabaseError>;

    async fn find_by_code(&self, order_code: &str) -> Result<Option<Order>, DatabaseError>;

    async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, DatabaseError>;

    async fn items_for_order(&self, order_id: Uuid) -> Result<Vec<OrderItem>, DatabaseError>;

    /// Distinct sellers across the order's items
    async fn sellers_for_order(&self, order_id: Uuid) -> Result<Vec<Uuid>, DatabaseError>;

    /// History oldest first
    async fn status_history(&self, order_id: Uuid)
        -> Result<Vec<StatusHistoryEntry>, DatabaseError>;

    /// Move `from` to `to` and append history, or return `None` when the
    /// order is no longer in `from`.
    async fn transition_status(
        &self,
        order_id: Uuid,
        from: &str,
        to: &str,
        note: &str,
    ) -> Result<Option<Order>, DatabaseError>;
}

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Append a history entry inside an open transaction
pub(crate) async fn append_history(
    tx: &mut Transaction<'_, Postgres>,
    order_id: Uuid,
    status: &str,
    note: &str,
) -> Result<(), DatabaseError> {
    sqlx::query("INSERT INTO order_status_history (order_id, status, note) VALUES ($1, $2, $3)")
        .bind(order_id)
        .bind(status)
        .bind(note)
        .execute(&mut **tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;
    Ok(())
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create_order(
        &self,
        order: &NewOrder,
        split: &PaymentSplit,
        initial_note: &str,
    ) -> Result<(Order, Payment), DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let created = sqlx::query_as::<_, Order>(&format!(
            "INSERT INTO orders (order_code, customer_id, customer_name, customer_email, customer_phone, \
             delivery_address, delivery_notes, total_amount, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending') \
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(&order.order_code)
        .bind(order.customer_id)
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(&order.customer_phone)
        .bind(&order.delivery_address)
        .bind(&order.delivery_notes)
        .bind(&order.total_amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        for item in &order.items {
            sqlx::query(
                "INSERT INTO order_items (order_id, product_id, product_name, unit_price, quantity, seller_id) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(created.id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(&item.unit_price)
            .bind(item.quantity)
            .bind(item.seller_id)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        }

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "INSERT INTO payments (order_id, deposit_amount, balance_amount, status) \
             VALUES ($1, $2, $3, 'pending') \
             RETURNING {}",
            PAYMENT_COLUMNS
        ))
        .bind(created.id)
        .bind(&split.deposit)
        .bind(&split.balance)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        append_history(&mut tx, created.id, &created.status, initial_note).await?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok((created, payment))
    }

    async fn find_by_code(&self, order_code: &str) -> Result<Option<Order>, DatabaseError> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE order_code = $1",
            ORDER_COLUMNS
        ))
        .bind(order_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn find_by_id(&self, order_id: Uuid) -> Result<Option<Order>, DatabaseError> {
        sqlx::query_as::<_, Order>(&format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    async fn items_for_order(&self, order_id: Uuid) -> Result<Vec<OrderItem>, DatabaseError> {
        sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {} FROM order_items WHERE order_id = $1 ORDER BY created_at ASC, id ASC",
            ITEM_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn sellers_for_order(&self, order_id: Uuid) -> Result<Vec<Uuid>, DatabaseError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT seller_id FROM order_items WHERE order_id = $1 ORDER BY seller_id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn status_history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<StatusHistoryEntry>, DatabaseError> {
        sqlx::query_as::<_, StatusHistoryEntry>(&format!(
            "SELECT {} FROM order_status_history WHERE order_id = $1 ORDER BY id ASC",
            HISTORY_COLUMNS
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn transition_status(
        &self,
        order_id: Uuid,
        from: &str,
        to: &str,
        note: &str,
    ) -> Result<Option<Order>, DatabaseError> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let updated = sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders SET status = $3, updated_at = NOW() \
             WHERE id = $1 AND status = $2 \
             RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .bind(from)
        .bind(to)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(order) = updated else {
            tx.rollback().await.map_err(DatabaseError::from_sqlx)?;
            return Ok(None);
        };

        append_history(&mut tx, order.id, to, note).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(Some(order))
    }
}
