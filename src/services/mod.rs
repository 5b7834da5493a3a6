//! Services module for business logic and integrations

pub mod checkout;
pub mod delivery;
pub mod notification;
pub mod order_lifecycle;
pub mod payment_service;
pub mod reconciliation;
pub mod webhook_processor;

pub use crate::services::order_lifecycle::{OrderLifecycleService, OrderStatus};
pub use crate::services::reconciliation::{ReconcileOutcome, ReconciliationEngine};
