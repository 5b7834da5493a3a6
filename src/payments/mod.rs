//! Payment gateway abstraction and the M-PESA Daraja implementation

pub mod error;
pub mod provider;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{GatewayError, GatewayResult};
pub use provider::PaymentGatewayClient;
pub use types::{InitiatedPayment, OutcomeSource, OutcomeStatus, PaymentOutcome};
