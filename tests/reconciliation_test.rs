mod common;

use bigdecimal::BigDecimal;
use common::{poll_outcome, stk_callback, Harness};
use crochet_shop_backend::database::payment_repository::{PaymentRepository, PaymentStatus};
use crochet_shop_backend::payments::error::GatewayError;
use crochet_shop_backend::payments::{OutcomeSource, PaymentOutcome};
use crochet_shop_backend::services::notification::NotificationType;
use crochet_shop_backend::services::payment_service::{PaymentServiceError, PollStatus};
use crochet_shop_backend::services::webhook_processor::WebhookProcessorError;
use crochet_shop_backend::services::{OrderStatus, ReconcileOutcome};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Barrier;
use uuid::Uuid;

fn kes(amount: &str) -> BigDecimal {
    BigDecimal::from_str(amount).unwrap()
}

#[tokio::test]
async fn deposit_flows_from_checkout_to_confirmed_order() {
    let h = Harness::new();
    let order_code = h.place_order(Uuid::new_v4(), "1250", 2).await;

    let details = h.details(&order_code).await;
    let payment = details.payment.expect("payment row created with the order");
    assert_eq!(details.order.total_amount, kes("2500"));
    assert_eq!(payment.deposit_amount, kes("500"));
    assert_eq!(payment.balance_amount, kes("2000"));
    assert_eq!(details.order.status, "pending");

    let initiated = h.payments.initiate_deposit(&order_code, None).await.unwrap();
    assert!(initiated.success);
    assert_eq!(initiated.checkout_request_id, "ws_CO_1");

    let attempt = h
        .store
        .find_attempt("ws_CO_1")
        .await
        .unwrap()
        .expect("attempt recorded");
    assert_eq!(attempt.phone, "254712345678");
    assert_eq!(attempt.amount_units, 500);

    let outcome = h
        .webhooks
        .process_callback(&stk_callback("ws_CO_1", 0, Some("ABC123")), None)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied(PaymentStatus::Completed));

    let details = h.details(&order_code).await;
    let payment = details.payment.unwrap();
    assert_eq!(details.order.status, "processing");
    assert!(payment.deposit_paid);
    assert_eq!(payment.deposit_receipt.as_deref(), Some("ABC123"));
    assert_eq!(details.history.len(), 2);
    assert!(details.history[1].note.contains("ABC123"));
    assert_eq!(h.sink.count(NotificationType::OrderConfirmed), 1);

    let poll = h.payments.poll_status(&order_code).await.unwrap();
    assert!(poll.success);
    assert_eq!(poll.payment_status, PollStatus::Completed);
    assert_eq!(poll.order_status, "processing");
    assert!(poll.message.contains("ABC123"));
    assert_eq!(h.gateway.query_calls(), 0, "settled payments are answered locally");
}

#[tokio::test]
async fn redelivered_callbacks_are_applied_once() {
    let h = Harness::new();
    let (order_code, correlation_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;
    let body = stk_callback(&correlation_id, 0, Some("ABC123"));

    let first = h.webhooks.process_callback(&body, None).await.unwrap();
    let second = h.webhooks.process_callback(&body, None).await.unwrap();
    let third = h.webhooks.process_callback(&body, None).await.unwrap();

    assert_eq!(first, ReconcileOutcome::Applied(PaymentStatus::Completed));
    assert_eq!(second, ReconcileOutcome::Duplicate);
    assert_eq!(third, ReconcileOutcome::Duplicate);

    let details = h.details(&order_code).await;
    assert_eq!(details.history.len(), 2);
    assert_eq!(h.sink.count(NotificationType::OrderConfirmed), 1);
}

#[tokio::test]
async fn failed_deposit_can_be_started_again() {
    let h = Harness::new();
    let (order_code, first_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;

    let outcome = h
        .webhooks
        .process_callback(&stk_callback(&first_id, 1032, None), None)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied(PaymentStatus::Failed));

    let details = h.details(&order_code).await;
    assert_eq!(details.order.status, "pending");
    assert_eq!(details.history.len(), 2);
    assert!(details.history[1].note.starts_with("M-PESA payment failed"));

    let poll = h.payments.poll_status(&order_code).await.unwrap();
    assert!(!poll.success);
    assert_eq!(poll.payment_status, PollStatus::Error);
    assert_eq!(poll.message, "Request cancelled by user");
    assert_eq!(h.gateway.query_calls(), 0);

    let retry = h.payments.initiate_deposit(&order_code, None).await.unwrap();
    assert_ne!(retry.checkout_request_id, first_id);

    let payment = h.details(&order_code).await.payment.unwrap();
    assert_eq!(payment.payment_status(), PaymentStatus::Pending);
    assert_eq!(payment.failure_reason, None);
    assert_eq!(
        payment.deposit_correlation_id.as_deref(),
        Some(retry.checkout_request_id.as_str())
    );

    let outcome = h
        .webhooks
        .process_callback(
            &stk_callback(&retry.checkout_request_id, 0, Some("XYZ789")),
            None,
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied(PaymentStatus::Completed));
    assert_eq!(h.details(&order_code).await.order.status, "processing");
}

#[tokio::test]
async fn failure_after_success_does_not_regress() {
    let h = Harness::new();
    let (order_code, correlation_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;

    h.webhooks
        .process_callback(&stk_callback(&correlation_id, 0, Some("ABC123")), None)
        .await
        .unwrap();
    let outcome = h
        .engine
        .reconcile(&poll_outcome(&correlation_id, "1", "Insufficient balance"))
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Duplicate);
    let payment = h.details(&order_code).await.payment.unwrap();
    assert_eq!(payment.payment_status(), PaymentStatus::Completed);
    assert_eq!(payment.failure_reason, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callback_and_poll_confirm_once() {
    for _ in 0..20 {
        let h = Harness::new();
        let (order_code, correlation_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;
        h.gateway.push_query(Ok(poll_outcome(
            &correlation_id,
            "0",
            "The service request is processed successfully.",
        )));

        // The poll parks inside the gateway query; the callback is released at the
        // same moment so both reconcile the same pending attempt in parallel
        let start = Arc::new(Barrier::new(2));
        h.gateway.hold_queries_at(start.clone());

        let payments = h.payments.clone();
        let poll_code = order_code.clone();
        let poll = tokio::spawn(async move { payments.poll_status(&poll_code).await });

        let webhooks = h.webhooks.clone();
        let body = stk_callback(&correlation_id, 0, Some("ABC123"));
        let callback = tokio::spawn(async move {
            start.wait().await;
            webhooks.process_callback(&body, None).await
        });

        let callback = callback.await.unwrap().unwrap();
        let poll = poll.await.unwrap().unwrap();

        assert_eq!(h.gateway.query_calls(), 1);
        assert_eq!(poll.payment_status, PollStatus::Completed);
        assert!(matches!(
            callback,
            ReconcileOutcome::Applied(_) | ReconcileOutcome::Duplicate
        ));

        let details = h.details(&order_code).await;
        let payment = details.payment.unwrap();
        assert_eq!(details.order.status, "processing");
        assert_eq!(details.history.len(), 2);
        assert_eq!(payment.deposit_receipt.as_deref(), Some("ABC123"));
        assert_eq!(h.sink.count(NotificationType::OrderConfirmed), 1);
    }
}

#[tokio::test]
async fn callback_for_unknown_attempt_is_orphaned() {
    let h = Harness::new();
    let (order_code, _) = h.order_awaiting_deposit(Uuid::new_v4()).await;

    let outcome = h
        .webhooks
        .process_callback(&stk_callback("ws_CO_never_issued", 0, Some("ABC123")), None)
        .await
        .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Orphaned);
    let details = h.details(&order_code).await;
    assert_eq!(details.order.status, "pending");
    assert_eq!(details.history.len(), 1);
    assert!(h.sink.all().iter().all(|n| n.kind == NotificationType::OrderPlaced));
}

#[tokio::test]
async fn unknown_outcome_changes_nothing() {
    let h = Harness::new();
    let (order_code, correlation_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;

    let outcome = h
        .engine
        .reconcile(&PaymentOutcome::unknown(
            &correlation_id,
            "The transaction is being processed",
            OutcomeSource::Poll,
        ))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Unconfirmed);

    // processing code 4999 is not final either
    let outcome = h
        .engine
        .reconcile(&poll_outcome(&correlation_id, "4999", "Still processing"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Unconfirmed);

    let poll = h.payments.poll_status(&order_code).await.unwrap();
    assert!(poll.success);
    assert_eq!(poll.payment_status, PollStatus::Pending);
    assert_eq!(h.gateway.query_calls(), 1);
    assert_eq!(h.details(&order_code).await.history.len(), 1);
}

#[tokio::test]
async fn failure_of_superseded_attempt_is_stale() {
    let h = Harness::new();
    let (order_code, first_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;
    let second = h.payments.initiate_deposit(&order_code, None).await.unwrap();

    let outcome = h
        .webhooks
        .process_callback(&stk_callback(&first_id, 1037, None), None)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::StaleAttempt);

    let payment = h.details(&order_code).await.payment.unwrap();
    assert_eq!(payment.payment_status(), PaymentStatus::Pending);
    assert_eq!(
        payment.deposit_correlation_id.as_deref(),
        Some(second.checkout_request_id.as_str())
    );

    let attempt = h.store.find_attempt(&first_id).await.unwrap().unwrap();
    assert_eq!(attempt.status, "failed");
}

#[tokio::test]
async fn late_success_of_older_attempt_is_honoured_once() {
    let h = Harness::new();
    let (order_code, first_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;
    let second = h.payments.initiate_deposit(&order_code, None).await.unwrap();

    let late = h
        .webhooks
        .process_callback(&stk_callback(&first_id, 0, Some("OLD111")), None)
        .await
        .unwrap();
    assert_eq!(late, ReconcileOutcome::Applied(PaymentStatus::Completed));

    let double = h
        .webhooks
        .process_callback(
            &stk_callback(&second.checkout_request_id, 0, Some("NEW222")),
            None,
        )
        .await
        .unwrap();
    assert_eq!(double, ReconcileOutcome::Duplicate);

    let details = h.details(&order_code).await;
    let payment = details.payment.unwrap();
    assert_eq!(payment.deposit_receipt.as_deref(), Some("OLD111"));
    assert_eq!(payment.deposit_correlation_id.as_deref(), Some(first_id.as_str()));
    assert_eq!(details.history.len(), 2);
    assert_eq!(h.sink.count(NotificationType::OrderConfirmed), 1);
}

#[tokio::test]
async fn deposit_on_cancelled_order_keeps_it_cancelled() {
    let h = Harness::new();
    let seller = Uuid::new_v4();
    let (order_code, correlation_id) = h.order_awaiting_deposit(seller).await;

    h.lifecycle
        .advance_status(&order_code, seller, OrderStatus::Cancelled, None)
        .await
        .unwrap();

    let outcome = h
        .webhooks
        .process_callback(&stk_callback(&correlation_id, 0, Some("ABC123")), None)
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied(PaymentStatus::Completed));

    let details = h.details(&order_code).await;
    assert_eq!(details.order.status, "cancelled");
    assert!(details.payment.unwrap().deposit_paid);
    assert_eq!(details.history.len(), 3);
    assert_eq!(h.sink.count(NotificationType::OrderConfirmed), 0);
}

#[tokio::test]
async fn initiation_is_refused_for_paid_and_cancelled_orders() {
    let h = Harness::new();
    let seller = Uuid::new_v4();

    let paid = h.paid_order(seller).await;
    let calls = h.gateway.initiate_calls();
    let err = h.payments.initiate_deposit(&paid, None).await.unwrap_err();
    assert!(matches!(err, PaymentServiceError::DepositAlreadyPaid(_)));
    assert_eq!(h.gateway.initiate_calls(), calls);

    let cancelled = h.place_order(seller, "800", 1).await;
    h.lifecycle
        .advance_status(&cancelled, seller, OrderStatus::Cancelled, None)
        .await
        .unwrap();
    let err = h.payments.initiate_deposit(&cancelled, None).await.unwrap_err();
    assert!(matches!(err, PaymentServiceError::OrderClosed { .. }));

    let err = h.payments.initiate_deposit("CR-1999-0001", None).await.unwrap_err();
    assert!(matches!(err, PaymentServiceError::OrderNotFound(_)));
}

#[tokio::test]
async fn gateway_rejection_leaves_payment_untouched() {
    let h = Harness::new();
    let order_code = h.place_order(Uuid::new_v4(), "2500", 1).await;
    h.gateway.fail_next_initiate(GatewayError::Business {
        code: Some("500.001.1001".to_string()),
        message: "Unable to lock subscriber".to_string(),
    });

    let err = h.payments.initiate_deposit(&order_code, None).await.unwrap_err();
    assert!(matches!(err, PaymentServiceError::Gateway(_)));
    assert_eq!(h.gateway.initiate_calls(), 1, "initiation is never retried");

    let payment = h.details(&order_code).await.payment.unwrap();
    assert_eq!(payment.deposit_correlation_id, None);

    let poll = h.payments.poll_status(&order_code).await.unwrap();
    assert_eq!(poll.payment_status, PollStatus::NoPayment);
}

#[tokio::test]
async fn phone_override_is_normalized() {
    let h = Harness::new();
    let order_code = h.place_order(Uuid::new_v4(), "2500", 1).await;

    let initiated = h
        .payments
        .initiate_deposit(&order_code, Some("+254 722 000 111"))
        .await
        .unwrap();
    let payment = h.details(&order_code).await.payment.unwrap();
    assert_eq!(payment.deposit_phone.as_deref(), Some("254722000111"));
    assert_eq!(initiated.checkout_request_id, "ws_CO_1");

    let err = h
        .payments
        .initiate_deposit(&order_code, Some("12345"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentServiceError::Gateway(GatewayError::InvalidPhoneFormat { .. })));
}

#[tokio::test]
async fn poll_retries_transient_query_errors() {
    let h = Harness::new();
    let (order_code, correlation_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;
    h.gateway.push_query(Err(GatewayError::Transport {
        message: "connection reset".to_string(),
    }));
    h.gateway.push_query(Err(GatewayError::Timeout {
        operation: "query".to_string(),
        timeout_secs: 12,
    }));
    h.gateway.push_query(Ok(poll_outcome(&correlation_id, "0", "Processed")));

    let poll = h.payments.poll_status(&order_code).await.unwrap();
    assert_eq!(poll.payment_status, PollStatus::Completed);
    assert_eq!(h.gateway.query_calls(), 3);
    assert_eq!(h.details(&order_code).await.order.status, "processing");
}

#[tokio::test]
async fn poll_reports_pending_when_gateway_refuses() {
    let h = Harness::new();
    let (order_code, _) = h.order_awaiting_deposit(Uuid::new_v4()).await;
    h.gateway.push_query(Err(GatewayError::Auth {
        message: "invalid credentials".to_string(),
    }));

    let poll = h.payments.poll_status(&order_code).await.unwrap();
    assert!(!poll.success);
    assert_eq!(poll.payment_status, PollStatus::Pending);
    assert_eq!(h.gateway.query_calls(), 1);
    assert_eq!(h.details(&order_code).await.payment.unwrap().status, "pending");
}

#[tokio::test]
async fn callback_token_must_match() {
    let h = Harness::with_callback_token(Some("s3cret"));
    let (order_code, correlation_id) = h.order_awaiting_deposit(Uuid::new_v4()).await;
    let body = stk_callback(&correlation_id, 0, Some("ABC123"));

    let err = h.webhooks.process_callback(&body, Some("wrong")).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidToken));
    let err = h.webhooks.process_callback(&body, None).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::InvalidToken));
    assert_eq!(h.details(&order_code).await.order.status, "pending");

    let outcome = h.webhooks.process_callback(&body, Some("s3cret")).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied(PaymentStatus::Completed));
}

#[tokio::test]
async fn malformed_callbacks_are_rejected() {
    let h = Harness::new();

    let err = h.webhooks.process_callback(b"not json", None).await.unwrap_err();
    assert!(matches!(err, WebhookProcessorError::Malformed(_)));

    let err = h
        .webhooks
        .process_callback(br#"{"Body":{"stkCallback":{"ResultCode":0}}}"#, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookProcessorError::Malformed(_)));
}
