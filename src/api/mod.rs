//! HTTP surface: order, payment and webhook routes

pub mod orders;
pub mod payments;
pub mod webhooks;

use crate::error::{AppError, ValidationError};
use crate::middleware::error::get_request_id_from_headers;
use crate::services::delivery::CustomerIdentity;
use axum::http::HeaderMap;
use axum::routing::{get, patch, post};
use axum::Router;
use std::sync::Arc;
use uuid::Uuid;

/// Set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";

/// Attach the request id to a service error
pub(crate) fn app_error(err: impl Into<AppError>, headers: &HeaderMap) -> AppError {
    let err = err.into();
    match get_request_id_from_headers(headers) {
        Some(request_id) => err.with_request_id(request_id),
        None => err,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn user_id(headers: &HeaderMap) -> Result<Option<Uuid>, AppError> {
    header_str(headers, USER_ID_HEADER)
        .map(|raw| {
            Uuid::parse_str(raw).map_err(|_| {
                AppError::validation(ValidationError::InvalidField {
                    field: USER_ID_HEADER.to_string(),
                    reason: "must be a UUID".to_string(),
                })
            })
        })
        .transpose()
}

/// Customer identity from the auth headers; may be empty
pub(crate) fn customer_identity(headers: &HeaderMap) -> Result<CustomerIdentity, AppError> {
    Ok(CustomerIdentity {
        user_id: user_id(headers)?,
        email: header_str(headers, USER_EMAIL_HEADER).map(str::to_string),
    })
}

/// Seller actions require a user id
pub(crate) fn seller_id(headers: &HeaderMap) -> Result<Uuid, AppError> {
    user_id(headers)?.ok_or_else(|| AppError::validation(ValidationError::MissingIdentity))
}

/// Build the API router from the three route groups
pub fn router(
    orders: Arc<orders::OrdersState>,
    payments: Arc<payments::PaymentsState>,
    webhooks: Arc<webhooks::WebhookState>,
) -> Router {
    let order_routes = Router::new()
        .route("/api/orders", post(orders::place_order))
        .route("/api/orders/{order_code}", get(orders::get_order))
        .route("/api/orders/{order_code}/status", patch(orders::update_status))
        .route(
            "/api/orders/{order_code}/confirm-delivery",
            post(orders::confirm_delivery),
        )
        .route("/api/orders/{order_code}/review", post(orders::submit_review))
        .with_state(orders);

    let payment_routes = Router::new()
        .route("/api/payments/mpesa/{order_code}", post(payments::initiate))
        .route(
            "/api/payments/mpesa/{order_code}/status",
            get(payments::poll_status),
        )
        .with_state(payments);

    let webhook_routes = Router::new()
        .route("/api/payments/mpesa/callback", post(webhooks::mpesa_callback))
        .with_state(webhooks);

    order_routes.merge(payment_routes).merge(webhook_routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_headers_are_parsed() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, id.to_string().parse().unwrap());
        headers.insert(USER_EMAIL_HEADER, " wambui@example.com ".parse().unwrap());

        let identity = customer_identity(&headers).unwrap();
        assert_eq!(identity.user_id, Some(id));
        assert_eq!(identity.email.as_deref(), Some("wambui@example.com"));
        assert_eq!(seller_id(&headers).unwrap(), id);
    }

    #[test]
    fn missing_seller_identity_is_unauthenticated() {
        let err = seller_id(&HeaderMap::new()).unwrap_err();
        assert_eq!(err.status_code(), 401);

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "not-a-uuid".parse().unwrap());
        assert_eq!(seller_id(&headers).unwrap_err().status_code(), 400);
    }
}
