use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Phone could not be normalized; raised before any network call
    #[error("Invalid phone number format: {phone}")]
    InvalidPhoneFormat { phone: String },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Credentials rejected or token endpoint unusable
    #[error("Gateway authentication failed: {message}")]
    Auth { message: String },

    #[error("Gateway {operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Gateway transport error: {message}")]
    Transport { message: String },

    /// Gateway understood the request and refused it
    #[error("Gateway rejected request: code={code:?}, message={message}")]
    Business {
        code: Option<String>,
        message: String,
    },

    #[error("Invalid gateway response: {message}")]
    InvalidResponse { message: String },
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::InvalidPhoneFormat { .. } => false,
            GatewayError::Validation { .. } => false,
            GatewayError::Auth { .. } => false,
            GatewayError::Timeout { .. } => true,
            GatewayError::Transport { .. } => true,
            GatewayError::Business { .. } => false,
            GatewayError::InvalidResponse { .. } => false,
        }
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidPhoneFormat { .. } => 400,
            GatewayError::Validation { .. } => 400,
            GatewayError::Auth { .. } => 503,
            GatewayError::Timeout { .. } => 504,
            GatewayError::Transport { .. } => 503,
            GatewayError::Business { .. } => 402,
            GatewayError::InvalidResponse { .. } => 503,
        }
    }

    /// Message safe to show a payer; never includes transport internals
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::InvalidPhoneFormat { .. } => {
                "Please enter a valid Safaricom number, e.g. 0712345678".to_string()
            }
            GatewayError::Validation { message, .. } => message.clone(),
            GatewayError::Auth { .. } | GatewayError::InvalidResponse { .. } => {
                "Payment service unavailable. Please try again later".to_string()
            }
            GatewayError::Timeout { .. } | GatewayError::Transport { .. } => {
                "Payment service is temporarily unreachable. Please try again".to_string()
            }
            GatewayError::Business { message, .. } => message.clone(),
        }
    }
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let provider = "mpesa".to_string();
        let kind = match err {
            GatewayError::InvalidPhoneFormat { phone } => {
                AppErrorKind::Validation(ValidationError::InvalidPhoneNumber {
                    phone,
                    reason: "expected a Kenyan mobile number such as 0712345678".to_string(),
                })
            }
            GatewayError::Validation { message, field } => {
                AppErrorKind::Validation(ValidationError::InvalidField {
                    field: field.unwrap_or_else(|| "request".to_string()),
                    reason: message,
                })
            }
            GatewayError::Auth { message } | GatewayError::InvalidResponse { message } => {
                AppErrorKind::External(ExternalError::PaymentServiceUnavailable {
                    provider,
                    message,
                })
            }
            GatewayError::Timeout { timeout_secs, .. } => {
                AppErrorKind::External(ExternalError::Timeout {
                    service: "M-PESA".to_string(),
                    timeout_secs,
                })
            }
            GatewayError::Transport { message } => {
                AppErrorKind::External(ExternalError::PaymentTransport { provider, message })
            }
            GatewayError::Business { message, .. } => {
                AppErrorKind::External(ExternalError::PaymentRejected { provider, message })
            }
        };

        AppError::new(kind)
    }
}
