use crate::api::{app_error, customer_identity, seller_id};
use crate::database::delivery_repository::{DeliveryConfirmation, SellerReview};
use crate::database::order_repository::{Order, OrderItem, StatusHistoryEntry};
use crate::database::payment_repository::Payment;
use crate::error::{AppError, ValidationError};
use crate::services::checkout::{CheckoutRequest, CheckoutService};
use crate::services::delivery::{DeliveryService, ReviewRequest};
use crate::services::order_lifecycle::{OrderLifecycleService, OrderStatus};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub struct OrdersState {
    pub checkout: Arc<CheckoutService>,
    pub lifecycle: Arc<OrderLifecycleService>,
    pub delivery: Arc<DeliveryService>,
}

#[derive(Debug, Serialize)]
pub struct PlacedOrderResponse {
    pub order_code: String,
    pub status: String,
    pub total_amount: BigDecimal,
    pub deposit_amount: BigDecimal,
    pub balance_amount: BigDecimal,
}

#[derive(Debug, Serialize)]
pub struct PaymentSummary {
    pub status: String,
    pub deposit_amount: BigDecimal,
    pub deposit_paid: bool,
    pub deposit_receipt: Option<String>,
    pub balance_amount: BigDecimal,
    pub balance_paid: bool,
    pub total_paid: BigDecimal,
    pub remaining_balance: BigDecimal,
    pub is_fully_paid: bool,
    pub failure_reason: Option<String>,
}

impl From<&Payment> for PaymentSummary {
    fn from(payment: &Payment) -> Self {
        Self {
            status: payment.status.clone(),
            deposit_amount: payment.deposit_amount.clone(),
            deposit_paid: payment.deposit_paid,
            deposit_receipt: payment.deposit_receipt.clone(),
            balance_amount: payment.balance_amount.clone(),
            balance_paid: payment.balance_paid,
            total_paid: payment.total_paid(),
            remaining_balance: payment.remaining_balance(),
            is_fully_paid: payment.is_fully_paid(),
            failure_reason: payment.failure_reason.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderView {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub payment: Option<PaymentSummary>,
    pub history: Vec<StatusHistoryEntry>,
    pub progress: u8,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: OrderStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfirmDeliveryRequest {
    #[serde(default)]
    note: Option<String>,
}

/// POST /api/orders
pub async fn place_order(
    State(state): State<Arc<OrdersState>>,
    headers: HeaderMap,
    Json(mut request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<PlacedOrderResponse>), AppError> {
    let identity = customer_identity(&headers).map_err(|e| app_error(e, &headers))?;
    if request.customer_id.is_none() {
        request.customer_id = identity.user_id;
    }

    let (order, payment) = state
        .checkout
        .place_order(&request)
        .await
        .map_err(|e| app_error(e, &headers))?;

    Ok((
        StatusCode::CREATED,
        Json(PlacedOrderResponse {
            order_code: order.order_code,
            status: order.status,
            total_amount: order.total_amount,
            deposit_amount: payment.deposit_amount,
            balance_amount: payment.balance_amount,
        }),
    ))
}

/// GET /api/orders/{order_code}
pub async fn get_order(
    State(state): State<Arc<OrdersState>>,
    Path(order_code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<OrderView>, AppError> {
    let details = state
        .lifecycle
        .order_details(&order_code)
        .await
        .map_err(|e| app_error(e, &headers))?;

    Ok(Json(OrderView {
        payment: details.payment.as_ref().map(PaymentSummary::from),
        order: details.order,
        items: details.items,
        history: details.history,
        progress: details.progress,
    }))
}

/// PATCH /api/orders/{order_code}/status
pub async fn update_status(
    State(state): State<Arc<OrdersState>>,
    Path(order_code): Path<String>,
    headers: HeaderMap,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Json<Order>, AppError> {
    let seller_id = seller_id(&headers).map_err(|e| app_error(e, &headers))?;

    let order = state
        .lifecycle
        .advance_status(&order_code, seller_id, request.status, request.note)
        .await
        .map_err(|e| app_error(e, &headers))?;

    Ok(Json(order))
}

/// POST /api/orders/{order_code}/confirm-delivery
pub async fn confirm_delivery(
    State(state): State<Arc<OrdersState>>,
    Path(order_code): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<DeliveryConfirmation>, AppError> {
    let identity = customer_identity(&headers).map_err(|e| app_error(e, &headers))?;
    let request: ConfirmDeliveryRequest = if body.is_empty() {
        ConfirmDeliveryRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            app_error(
                AppError::validation(ValidationError::InvalidField {
                    field: "body".to_string(),
                    reason: e.to_string(),
                }),
                &headers,
            )
        })?
    };

    let confirmation = state
        .delivery
        .confirm_delivery(&order_code, &identity, request.note.as_deref())
        .await
        .map_err(|e| app_error(e, &headers))?;

    info!(order_code = %order_code, "Delivery confirmation returned");
    Ok(Json(confirmation))
}

/// POST /api/orders/{order_code}/review
pub async fn submit_review(
    State(state): State<Arc<OrdersState>>,
    Path(order_code): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ReviewRequest>,
) -> Result<Json<SellerReview>, AppError> {
    let identity = customer_identity(&headers).map_err(|e| app_error(e, &headers))?;

    let review = state
        .delivery
        .submit_review(&order_code, &identity, &request)
        .await
        .map_err(|e| app_error(e, &headers))?;

    Ok(Json(review))
}
