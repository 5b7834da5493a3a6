use crate::api::app_error;
use crate::error::{AppError, ValidationError};
use crate::services::payment_service::{InitiateResponse, PaymentService, PollResponse};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

pub struct PaymentsState {
    pub payments: Arc<PaymentService>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InitiateRequest {
    #[serde(default)]
    pub phone: Option<String>,
}

/// POST /api/payments/mpesa/{order_code}
///
/// The body is optional; `{"phone": "07..."}` overrides the order's phone.
pub async fn initiate(
    State(state): State<Arc<PaymentsState>>,
    Path(order_code): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InitiateResponse>, AppError> {
    let request: InitiateRequest = if body.is_empty() {
        InitiateRequest::default()
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

    let response = state
        .payments
        .initiate_deposit(&order_code, request.phone.as_deref())
        .await
        .map_err(|e| app_error(e, &headers))?;

    Ok(Json(response))
}

/// GET /api/payments/mpesa/{order_code}/status
pub async fn poll_status(
    State(state): State<Arc<PaymentsState>>,
    Path(order_code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PollResponse>, AppError> {
    let response = state
        .payments
        .poll_status(&order_code)
        .await
        .map_err(|e| app_error(e, &headers))?;

    Ok(Json(response))
}
