//! Unified error handling for the shop backend
//!
//! Every layer keeps its own error enum (gateway, database, services) and
//! folds into [`AppError`] at the HTTP boundary, which carries the status
//! mapping, the machine-readable [`ErrorCode`] and the user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "ORDER_NOT_FOUND")]
    OrderNotFound,
    #[serde(rename = "PAYMENT_NOT_FOUND")]
    PaymentNotFound,
    #[serde(rename = "INVALID_STATUS_TRANSITION")]
    InvalidStatusTransition,
    #[serde(rename = "NOT_ORDER_SELLER")]
    NotOrderSeller,
    #[serde(rename = "NOT_ORDER_CUSTOMER")]
    NotOrderCustomer,
    #[serde(rename = "DEPOSIT_ALREADY_PAID")]
    DepositAlreadyPaid,
    #[serde(rename = "ORDER_NOT_DELIVERED")]
    OrderNotDelivered,
    #[serde(rename = "DELIVERY_NOT_CONFIRMED")]
    DeliveryNotConfirmed,
    #[serde(rename = "CONCURRENT_UPDATE")]
    ConcurrentUpdate,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "PAYMENT_REJECTED")]
    PaymentRejected,
    #[serde(rename = "PAYMENT_SERVICE_UNAVAILABLE")]
    PaymentServiceUnavailable,
    #[serde(rename = "EXTERNAL_SERVICE_TIMEOUT")]
    ExternalServiceTimeout,

    // Generic
    #[serde(rename = "UNAUTHENTICATED")]
    Unauthenticated,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// No order carries the given code
    OrderNotFound { order_code: String },
    /// Order exists but has no payment record
    PaymentNotFound { order_code: String },
    /// Requested lifecycle move is not allowed from the current status
    InvalidStatusTransition {
        order_code: String,
        from: String,
        to: String,
    },
    /// Caller is not a seller of any item on the order
    NotOrderSeller { order_code: String },
    /// Caller is not the customer who placed the order
    NotOrderCustomer { order_code: String },
    /// Deposit was already settled, a new prompt would double charge
    DepositAlreadyPaid { order_code: String },
    /// Delivery confirmation requires a delivered order
    OrderNotDelivered { order_code: String, status: String },
    /// Reviews require a confirmed delivery
    DeliveryNotConfirmed { order_code: String },
    /// Another writer changed the order between read and write
    ConcurrentUpdate { order_code: String },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Database connection or query failure
    Database { message: String, is_retryable: bool },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// Payment gateway errors as seen by API callers
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Gateway explicitly rejected the request
    PaymentRejected { provider: String, message: String },
    /// Gateway credentials rejected or gateway returned an unusable answer
    PaymentServiceUnavailable { provider: String, message: String },
    /// Network failure talking to the gateway
    PaymentTransport { provider: String, message: String },
    /// External service timeout
    Timeout { service: String, timeout_secs: u64 },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// Phone number cannot be normalized to the gateway format
    InvalidPhoneNumber { phone: String, reason: String },
    /// Invalid amount (format or value)
    InvalidAmount { amount: String, reason: String },
    /// Required field missing
    MissingField { field: String },
    /// Field value out of acceptable range
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
    },
    /// Field present but unusable
    InvalidField { field: String, reason: String },
    /// No usable caller identity on the request
    MissingIdentity,
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn domain(err: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(err))
    }

    pub fn validation(err: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(err))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => 404,
                DomainError::PaymentNotFound { .. } => 404,
                DomainError::InvalidStatusTransition { .. } => 422,
                DomainError::NotOrderSeller { .. } => 403,
                DomainError::NotOrderCustomer { .. } => 403,
                DomainError::DepositAlreadyPaid { .. } => 409,
                DomainError::OrderNotDelivered { .. } => 422,
                DomainError::DeliveryNotConfirmed { .. } => 422,
                DomainError::ConcurrentUpdate { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentRejected { .. } => 402,
                ExternalError::PaymentServiceUnavailable { .. } => 503,
                ExternalError::PaymentTransport { .. } => 503,
                ExternalError::Timeout { .. } => 504,
            },
            AppErrorKind::Validation(ValidationError::MissingIdentity) => 401,
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { .. } => ErrorCode::OrderNotFound,
                DomainError::PaymentNotFound { .. } => ErrorCode::PaymentNotFound,
                DomainError::InvalidStatusTransition { .. } => ErrorCode::InvalidStatusTransition,
                DomainError::NotOrderSeller { .. } => ErrorCode::NotOrderSeller,
                DomainError::NotOrderCustomer { .. } => ErrorCode::NotOrderCustomer,
                DomainError::DepositAlreadyPaid { .. } => ErrorCode::DepositAlreadyPaid,
                DomainError::OrderNotDelivered { .. } => ErrorCode::OrderNotDelivered,
                DomainError::DeliveryNotConfirmed { .. } => ErrorCode::DeliveryNotConfirmed,
                DomainError::ConcurrentUpdate { .. } => ErrorCode::ConcurrentUpdate,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentRejected { .. } => ErrorCode::PaymentRejected,
                ExternalError::PaymentServiceUnavailable { .. }
                | ExternalError::PaymentTransport { .. } => ErrorCode::PaymentServiceUnavailable,
                ExternalError::Timeout { .. } => ErrorCode::ExternalServiceTimeout,
            },
            AppErrorKind::Validation(ValidationError::MissingIdentity) => {
                ErrorCode::Unauthenticated
            }
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::OrderNotFound { order_code } => {
                    format!("Order '{}' not found. Please check your order code", order_code)
                }
                DomainError::PaymentNotFound { order_code } => {
                    format!("No payment record exists for order '{}'", order_code)
                }
                DomainError::InvalidStatusTransition { from, to, .. } => {
                    format!("Order cannot move from '{}' to '{}'", from, to)
                }
                DomainError::NotOrderSeller { .. } => {
                    "Only the seller of this order can update its status".to_string()
                }
                DomainError::NotOrderCustomer { .. } => {
                    "Only the customer who placed this order can do that".to_string()
                }
                DomainError::DepositAlreadyPaid { order_code } => {
                    format!("The deposit for order '{}' has already been paid", order_code)
                }
                DomainError::OrderNotDelivered { status, .. } => {
                    format!(
                        "Delivery can only be confirmed once the order is delivered (current status: {})",
                        status
                    )
                }
                DomainError::DeliveryNotConfirmed { .. } => {
                    "Please confirm delivery before leaving a review".to_string()
                }
                DomainError::ConcurrentUpdate { .. } => {
                    "The order was updated by someone else. Please reload and try again"
                        .to_string()
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentRejected { message, .. } => {
                    format!("Payment request was rejected: {}", message)
                }
                ExternalError::PaymentServiceUnavailable { .. } => {
                    "Payment service unavailable. Please try again later".to_string()
                }
                ExternalError::PaymentTransport { .. } => {
                    "Payment service is temporarily unreachable. Please try again".to_string()
                }
                ExternalError::Timeout {
                    service,
                    timeout_secs,
                } => format!(
                    "{} request timed out after {} seconds. Please try again",
                    service, timeout_secs
                ),
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidPhoneNumber { phone, reason } => {
                    format!("Invalid phone number '{}': {}", phone, reason)
                }
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::OutOfRange { field, min, max } => match (min, max) {
                    (Some(min), Some(max)) => {
                        format!("Field '{}' must be between {} and {}", field, min, max)
                    }
                    (Some(min), None) => format!("Field '{}' must be at least {}", field, min),
                    (None, Some(max)) => format!("Field '{}' must be at most {}", field, max),
                    (None, None) => format!("Field '{}' is out of acceptable range", field),
                },
                ValidationError::InvalidField { field, reason } => {
                    format!("Invalid value for '{}': {}", field, reason)
                }
                ValidationError::MissingIdentity => {
                    "This action requires a signed-in customer or seller".to_string()
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(DomainError::ConcurrentUpdate { .. }) => true,
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::PaymentRejected { .. } => false,
                ExternalError::PaymentServiceUnavailable { .. } => true,
                ExternalError::PaymentTransport { .. } => true,
                ExternalError::Timeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError> lives in database/error.rs, From<GatewayError> in payments/error.rs

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
