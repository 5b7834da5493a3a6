use axum::{
    body::{to_bytes, Body},
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::services::webhook_processor::{WebhookProcessor, WebhookProcessorError};

/// STK callbacks are a few hundred bytes; anything past this is dropped unread
pub const MAX_CALLBACK_BYTES: usize = 64 * 1024;

pub struct WebhookState {
    pub processor: Arc<WebhookProcessor>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub token: Option<String>,
}

/// Daraja stops redelivering once it sees this
fn accepted() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({"ResultCode": 0, "ResultDesc": "Accepted"})),
    )
}

/// POST /api/payments/mpesa/callback
pub async fn mpesa_callback(
    State(state): State<Arc<WebhookState>>,
    query: Result<Query<CallbackQuery>, QueryRejection>,
    body: Body,
) -> impl IntoResponse {
    let token = query.ok().and_then(|Query(q)| q.token);

    let body = match to_bytes(body, MAX_CALLBACK_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(
                error = %e,
                limit = MAX_CALLBACK_BYTES,
                "M-PESA callback body unreadable or too large; acknowledged and ignored"
            );
            return accepted();
        }
    };

    match state
        .processor
        .process_callback(&body, token.as_deref())
        .await
    {
        Ok(outcome) => {
            info!(outcome = ?outcome, "M-PESA callback acknowledged");
        }
        Err(WebhookProcessorError::InvalidToken) => {
            warn!("M-PESA callback with invalid token acknowledged and ignored");
        }
        Err(e) => {
            warn!(error = %e, "M-PESA callback acknowledged without being applied");
        }
    }

    accepted()
}
