#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use bigdecimal::BigDecimal;
use chrono::Utc;
use crochet_shop_backend::api;
use crochet_shop_backend::database::in_memory::InMemoryStore;
use crochet_shop_backend::payments::error::{GatewayError, GatewayResult};
use crochet_shop_backend::payments::providers::mpesa::normalize_msisdn;
use crochet_shop_backend::payments::types::AccessToken;
use crochet_shop_backend::payments::utils::to_whole_units;
use crochet_shop_backend::payments::{
    InitiatedPayment, OutcomeSource, PaymentGatewayClient, PaymentOutcome,
};
use crochet_shop_backend::services::checkout::{CheckoutItem, CheckoutRequest, CheckoutService};
use crochet_shop_backend::services::delivery::DeliveryService;
use crochet_shop_backend::services::notification::{
    Notification, NotificationError, NotificationSink, NotificationType,
};
use crochet_shop_backend::services::order_lifecycle::{OrderDetails, OrderLifecycleService};
use crochet_shop_backend::services::payment_service::PaymentService;
use crochet_shop_backend::services::reconciliation::ReconciliationEngine;
use crochet_shop_backend::services::webhook_processor::WebhookProcessor;
use serde_json::json;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;
use uuid::Uuid;

/// Scriptable gateway: hands out `ws_CO_{n}` ids and replays queued query results
#[derive(Default)]
pub struct MockGateway {
    initiate_calls: AtomicUsize,
    query_calls: AtomicUsize,
    initiate_error: Mutex<Option<GatewayError>>,
    query_script: Mutex<VecDeque<GatewayResult<PaymentOutcome>>>,
    query_gate: Mutex<Option<Arc<Barrier>>>,
}

impl MockGateway {
    pub fn fail_next_initiate(&self, error: GatewayError) {
        *self.initiate_error.lock().unwrap() = Some(error);
    }

    pub fn push_query(&self, result: GatewayResult<PaymentOutcome>) {
        self.query_script.lock().unwrap().push_back(result);
    }

    /// Every query waits on `barrier` before answering
    pub fn hold_queries_at(&self, barrier: Arc<Barrier>) {
        *self.query_gate.lock().unwrap() = Some(barrier);
    }

    pub fn initiate_calls(&self) -> usize {
        self.initiate_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGatewayClient for MockGateway {
    async fn authenticate(&self) -> GatewayResult<AccessToken> {
        Ok(AccessToken {
            token: "mock-token".to_string(),
            expires_in_secs: 3599,
            issued_at: Utc::now(),
        })
    }

    async fn initiate_payment(
        &self,
        phone: &str,
        amount: &BigDecimal,
        _order_code: &str,
    ) -> GatewayResult<InitiatedPayment> {
        let normalized_phone = normalize_msisdn(phone)?;
        to_whole_units(amount)?;
        let n = self.initiate_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.initiate_error.lock().unwrap().take() {
            return Err(error);
        }

        Ok(InitiatedPayment {
            correlation_id: format!("ws_CO_{}", n),
            merchant_request_id: Some(format!("mr_{}", n)),
            customer_message: "Success. Request accepted for processing".to_string(),
            normalized_phone,
        })
    }

    async fn query_status(&self, correlation_id: &str) -> GatewayResult<PaymentOutcome> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.query_gate.lock().unwrap().clone();
        if let Some(barrier) = gate {
            barrier.wait().await;
        }
        self.query_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(PaymentOutcome::unknown(
                    correlation_id,
                    "The transaction is being processed",
                    OutcomeSource::Poll,
                ))
            })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Keeps every notification it is handed
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, kind: NotificationType) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<MockGateway>,
    pub sink: Arc<RecordingSink>,
    pub engine: Arc<ReconciliationEngine>,
    pub checkout: Arc<CheckoutService>,
    pub lifecycle: Arc<OrderLifecycleService>,
    pub delivery: Arc<DeliveryService>,
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_callback_token(None)
    }

    pub fn with_callback_token(token: Option<&str>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::default());
        let sink = Arc::new(RecordingSink::default());

        let engine = Arc::new(ReconciliationEngine::new(store.clone(), sink.clone()));
        let checkout = Arc::new(CheckoutService::new(store.clone(), sink.clone(), 5));
        let lifecycle = Arc::new(OrderLifecycleService::new(
            store.clone(),
            store.clone(),
            sink.clone(),
        ));
        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            store.clone(),
            sink.clone(),
        ));
        let payments = Arc::new(
            PaymentService::new(
                store.clone(),
                store.clone(),
                gateway.clone(),
                engine.clone(),
                2,
            )
            .with_retry_backoff(Duration::ZERO),
        );
        let webhooks = Arc::new(WebhookProcessor::new(
            engine.clone(),
            token.map(str::to_string),
        ));

        Self {
            store,
            gateway,
            sink,
            engine,
            checkout,
            lifecycle,
            delivery,
            payments,
            webhooks,
        }
    }

    pub fn router(&self) -> Router {
        api::router(
            Arc::new(api::orders::OrdersState {
                checkout: self.checkout.clone(),
                lifecycle: self.lifecycle.clone(),
                delivery: self.delivery.clone(),
            }),
            Arc::new(api::payments::PaymentsState {
                payments: self.payments.clone(),
            }),
            Arc::new(api::webhooks::WebhookState {
                processor: self.webhooks.clone(),
            }),
        )
    }

    pub async fn details(&self, order_code: &str) -> OrderDetails {
        self.lifecycle
            .order_details(order_code)
            .await
            .expect("order should exist")
    }

    /// Place a single-line order and return its code
    pub async fn place_order(&self, seller_id: Uuid, unit_price: &str, quantity: i32) -> String {
        let request = checkout_request(vec![item(seller_id, unit_price, quantity)]);
        let (order, _) = self
            .checkout
            .place_order(&request)
            .await
            .expect("order should be placed");
        order.order_code
    }

    /// Place an order and start its deposit, returning the order code and correlation id
    pub async fn order_awaiting_deposit(&self, seller_id: Uuid) -> (String, String) {
        let order_code = self.place_order(seller_id, "2500", 1).await;
        let initiated = self
            .payments
            .initiate_deposit(&order_code, None)
            .await
            .expect("deposit should be initiated");
        (order_code, initiated.checkout_request_id)
    }

    /// Place an order and settle its deposit through the callback
    pub async fn paid_order(&self, seller_id: Uuid) -> String {
        let (order_code, correlation_id) = self.order_awaiting_deposit(seller_id).await;
        self.webhooks
            .process_callback(&stk_callback(&correlation_id, 0, Some("RCP0001")), None)
            .await
            .expect("callback should be applied");
        order_code
    }

    /// Walk a paid order through the seller steps up to delivered
    pub async fn delivered_order(&self, seller_id: Uuid) -> String {
        use crochet_shop_backend::services::OrderStatus;

        let order_code = self.paid_order(seller_id).await;
        for status in [
            OrderStatus::Packed,
            OrderStatus::OnTheWay,
            OrderStatus::Delivered,
        ] {
            self.lifecycle
                .advance_status(&order_code, seller_id, status, None)
                .await
                .expect("seller step should be allowed");
        }
        order_code
    }
}

pub fn item(seller_id: Uuid, unit_price: &str, quantity: i32) -> CheckoutItem {
    CheckoutItem {
        product_id: Uuid::new_v4(),
        product_name: "Chunky knit cardigan".to_string(),
        unit_price: BigDecimal::from_str(unit_price).unwrap(),
        quantity,
        seller_id,
    }
}

pub fn checkout_request(items: Vec<CheckoutItem>) -> CheckoutRequest {
    CheckoutRequest {
        customer_id: None,
        customer_name: "Wanjiku Kamau".to_string(),
        customer_email: "wanjiku@example.com".to_string(),
        customer_phone: "0712345678".to_string(),
        delivery_address: "Moi Avenue, Nairobi".to_string(),
        delivery_notes: None,
        items,
    }
}

/// Daraja STK result callback body; metadata is only present on success
pub fn stk_callback(correlation_id: &str, result_code: i64, receipt: Option<&str>) -> Vec<u8> {
    let mut callback = json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": correlation_id,
        "ResultCode": result_code,
        "ResultDesc": if result_code == 0 {
            "The service request is processed successfully."
        } else {
            "Request cancelled by user"
        },
    });

    if let Some(receipt) = receipt {
        callback["CallbackMetadata"] = json!({
            "Item": [
                {"Name": "Amount", "Value": 500.00},
                {"Name": "MpesaReceiptNumber", "Value": receipt},
                {"Name": "TransactionDate", "Value": 20261019102115_i64},
                {"Name": "PhoneNumber", "Value": 254712345678_i64}
            ]
        });
    }

    serde_json::to_vec(&json!({"Body": {"stkCallback": callback}})).unwrap()
}

pub fn poll_outcome(correlation_id: &str, result_code: &str, description: &str) -> PaymentOutcome {
    PaymentOutcome::new(
        correlation_id,
        Some(result_code.to_string()),
        description,
        OutcomeSource::Poll,
    )
}
