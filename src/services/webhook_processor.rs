use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::payments::error::GatewayError;
use crate::payments::providers::mpesa::parse_stk_callback;
use crate::payments::utils::{payload_fingerprint, secure_eq};
use crate::services::reconciliation::{ReconcileError, ReconcileOutcome, ReconciliationEngine};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Invalid callback token")]
    InvalidToken,
    #[error("Malformed callback: {0}")]
    Malformed(String),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl From<GatewayError> for WebhookProcessorError {
    fn from(err: GatewayError) -> Self {
        WebhookProcessorError::Malformed(err.to_string())
    }
}

/// Entry point for M-PESA result callbacks.
///
/// Errors are for logging only; the HTTP layer acknowledges every callback
/// so Daraja does not keep redelivering it.
pub struct WebhookProcessor {
    engine: Arc<ReconciliationEngine>,
    callback_token: Option<String>,
}

impl WebhookProcessor {
    pub fn new(engine: Arc<ReconciliationEngine>, callback_token: Option<String>) -> Self {
        Self {
            engine,
            callback_token: callback_token.filter(|t| !t.is_empty()),
        }
    }

    pub async fn process_callback(
        &self,
        raw_body: &[u8],
        token: Option<&str>,
    ) -> Result<ReconcileOutcome, WebhookProcessorError> {
        let fingerprint = payload_fingerprint(raw_body);

        if let Some(expected) = &self.callback_token {
            let presented = token.unwrap_or_default();
            if !secure_eq(expected.as_bytes(), presented.as_bytes()) {
                warn!(fingerprint = %fingerprint, "Callback token mismatch; ignoring callback");
                return Err(WebhookProcessorError::InvalidToken);
            }
        }

        let payload: JsonValue = serde_json::from_slice(raw_body).map_err(|e| {
            warn!(fingerprint = %fingerprint, error = %e, "Callback body is not JSON");
            WebhookProcessorError::Malformed(e.to_string())
        })?;

        let outcome = parse_stk_callback(&payload).map_err(|e| {
            warn!(fingerprint = %fingerprint, error = %e, "Callback body not understood");
            WebhookProcessorError::from(e)
        })?;

        info!(
            fingerprint = %fingerprint,
            correlation_id = %outcome.correlation_id,
            result_code = ?outcome.result_code,
            outcome = ?outcome.status,
            "M-PESA callback received"
        );

        self.engine.reconcile(&outcome).await.map_err(|e| {
            error!(
                fingerprint = %fingerprint,
                correlation_id = %outcome.correlation_id,
                error = %e,
                "Callback could not be reconciled"
            );
            WebhookProcessorError::from(e)
        })
    }
}
