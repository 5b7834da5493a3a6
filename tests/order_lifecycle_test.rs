mod common;

use bigdecimal::BigDecimal;
use common::{checkout_request, item, Harness};
use crochet_shop_backend::error::AppError;
use crochet_shop_backend::services::checkout::CheckoutError;
use crochet_shop_backend::services::notification::{NotificationType, Recipient};
use crochet_shop_backend::services::order_lifecycle::LifecycleError;
use crochet_shop_backend::services::OrderStatus;
use std::str::FromStr;
use uuid::Uuid;

fn kes(amount: &str) -> BigDecimal {
    BigDecimal::from_str(amount).unwrap()
}

#[tokio::test]
async fn checkout_records_order_and_notifies_customer() {
    let h = Harness::new();
    let request = checkout_request(vec![
        item(Uuid::new_v4(), "1200.50", 1),
        item(Uuid::new_v4(), "399.995", 2),
    ]);

    let (order, payment) = h.checkout.place_order(&request).await.unwrap();

    assert!(order.order_code.starts_with("CR-"));
    assert_eq!(order.status, "pending");
    // 399.995 rounds to 400.00 per unit
    assert_eq!(order.total_amount, kes("2000.50"));
    assert_eq!(payment.deposit_amount, kes("400.10"));
    assert_eq!(payment.balance_amount, kes("1600.40"));

    let details = h.details(&order.order_code).await;
    assert_eq!(details.items.len(), 2);
    assert_eq!(details.history.len(), 1);
    assert_eq!(details.progress, 20);
    assert_eq!(h.sink.count(NotificationType::OrderPlaced), 1);
}

#[tokio::test]
async fn checkout_rejects_bad_requests() {
    let h = Harness::new();

    let err = h.checkout.place_order(&checkout_request(vec![])).await.unwrap_err();
    assert!(matches!(err, CheckoutError::EmptyOrder));

    let err = h
        .checkout
        .place_order(&checkout_request(vec![item(Uuid::new_v4(), "500", 0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, CheckoutError::InvalidField { .. }));

    let mut request = checkout_request(vec![item(Uuid::new_v4(), "500", 1)]);
    request.customer_email = "not-an-email".to_string();
    let err = h.checkout.place_order(&request).await.unwrap_err();
    assert!(matches!(err, CheckoutError::InvalidField { .. }));
    let app: AppError = err.into();
    assert_eq!(app.status_code(), 400);

    // Larger than NUMERIC(12, 2) can store
    for items in [
        vec![item(Uuid::new_v4(), "100000000000", 1)],
        vec![
            item(Uuid::new_v4(), "6000000000", 1),
            item(Uuid::new_v4(), "4000000000", 1),
        ],
    ] {
        let err = h.checkout.place_order(&checkout_request(items)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::InvalidField { .. }));
        let app: AppError = err.into();
        assert_eq!(app.status_code(), 400);
    }

    assert_eq!(h.sink.all().len(), 0);
}

#[tokio::test]
async fn seller_moves_paid_order_to_delivered() {
    let h = Harness::new();
    let seller = Uuid::new_v4();
    let order_code = h.paid_order(seller).await;

    let order = h
        .lifecycle
        .advance_status(&order_code, seller, OrderStatus::Packed, None)
        .await
        .unwrap();
    assert_eq!(order.status, "packed");
    assert_eq!(h.sink.count(NotificationType::OrderShipped), 0);

    h.lifecycle
        .advance_status(
            &order_code,
            seller,
            OrderStatus::OnTheWay,
            Some("Sent with G4S".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(h.sink.count(NotificationType::OrderShipped), 1);

    h.lifecycle
        .advance_status(&order_code, seller, OrderStatus::Delivered, None)
        .await
        .unwrap();
    assert_eq!(h.sink.count(NotificationType::OrderDelivered), 1);

    let details = h.details(&order_code).await;
    assert_eq!(details.order.status, "delivered");
    assert_eq!(details.progress, 100);
    let notes: Vec<&str> = details.history.iter().map(|e| e.note.as_str()).collect();
    assert_eq!(notes.len(), 5);
    assert_eq!(notes[3], "Sent with G4S");
    assert_eq!(notes[4], "Order delivered");

    let shipped = h
        .sink
        .all()
        .into_iter()
        .find(|n| n.kind == NotificationType::OrderShipped)
        .unwrap();
    assert!(matches!(shipped.recipient, Recipient::Customer { .. }));
}

#[tokio::test]
async fn sellers_cannot_mark_orders_paid() {
    let h = Harness::new();
    let seller = Uuid::new_v4();
    let order_code = h.place_order(seller, "2500", 1).await;

    let err = h
        .lifecycle
        .advance_status(&order_code, seller, OrderStatus::Processing, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::PaymentDriven(_)));

    let app: AppError = err.into();
    assert_eq!(app.status_code(), 422);
    assert_eq!(h.details(&order_code).await.order.status, "pending");
}

#[tokio::test]
async fn steps_cannot_be_skipped_or_reversed() {
    let h = Harness::new();
    let seller = Uuid::new_v4();
    let order_code = h.paid_order(seller).await;

    let err = h
        .lifecycle
        .advance_status(&order_code, seller, OrderStatus::Delivered, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

    h.lifecycle
        .advance_status(&order_code, seller, OrderStatus::Packed, None)
        .await
        .unwrap();
    let err = h
        .lifecycle
        .advance_status(&order_code, seller, OrderStatus::Pending, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
}

#[tokio::test]
async fn delivered_orders_cannot_be_cancelled() {
    let h = Harness::new();
    let seller = Uuid::new_v4();
    let order_code = h.delivered_order(seller).await;

    let err = h
        .lifecycle
        .advance_status(&order_code, seller, OrderStatus::Cancelled, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
}

#[tokio::test]
async fn only_sellers_on_the_order_may_update_it() {
    let h = Harness::new();
    let seller = Uuid::new_v4();
    let order_code = h.paid_order(seller).await;

    let err = h
        .lifecycle
        .advance_status(&order_code, Uuid::new_v4(), OrderStatus::Packed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::NotSeller(_)));
    let app: AppError = err.into();
    assert_eq!(app.status_code(), 403);

    let err = h
        .lifecycle
        .advance_status("CR-1999-0001", seller, OrderStatus::Packed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::OrderNotFound(_)));
}

#[tokio::test]
async fn any_seller_on_a_shared_order_may_cancel() {
    let h = Harness::new();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let request = checkout_request(vec![item(first, "900", 1), item(second, "600", 1)]);
    let (order, _) = h.checkout.place_order(&request).await.unwrap();

    let cancelled = h
        .lifecycle
        .advance_status(&order.order_code, second, OrderStatus::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, "cancelled");

    let details = h.details(&order.order_code).await;
    assert_eq!(details.progress, 0);
    assert_eq!(details.history[1].note, "Order cancelled by seller");
}
