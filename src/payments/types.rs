use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Daraja result code for "insufficient information yet", treated as not final
pub const RESULT_CODE_PENDING: i64 = 4999;

/// Short-lived bearer token issued by the gateway
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in_secs: u64,
    pub issued_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_in_secs", &self.expires_in_secs)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Accepted payment prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitiatedPayment {
    /// CheckoutRequestID, the key both callback and query carry
    pub correlation_id: String,
    pub merchant_request_id: Option<String>,
    /// Text the gateway wants shown to the payer
    pub customer_message: String,
    pub normalized_phone: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
    /// Not final or not understood; never applied as success
    Unknown,
}

impl OutcomeStatus {
    /// Classify a raw gateway result code.
    ///
    /// `0` is success, other integers are failures except the "still
    /// processing" code, anything unparseable is unknown.
    pub fn from_result_code(code: Option<&str>) -> Self {
        match code.map(str::trim).and_then(|c| c.parse::<i64>().ok()) {
            Some(0) => OutcomeStatus::Success,
            Some(RESULT_CODE_PENDING) => OutcomeStatus::Unknown,
            Some(_) => OutcomeStatus::Failure,
            None => OutcomeStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeSource {
    Webhook,
    Poll,
}

impl OutcomeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeSource::Webhook => "webhook",
            OutcomeSource::Poll => "poll",
        }
    }
}

impl fmt::Display for OutcomeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment result reported by the gateway through either channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub correlation_id: String,
    pub status: OutcomeStatus,
    pub result_code: Option<String>,
    pub description: String,
    /// External receipt reference (MpesaReceiptNumber)
    pub receipt: Option<String>,
    pub amount: Option<BigDecimal>,
    pub phone: Option<String>,
    pub transaction_date: Option<String>,
    pub source: OutcomeSource,
    pub received_at: DateTime<Utc>,
}

impl PaymentOutcome {
    pub fn new(
        correlation_id: impl Into<String>,
        result_code: Option<String>,
        description: impl Into<String>,
        source: OutcomeSource,
    ) -> Self {
        let status = OutcomeStatus::from_result_code(result_code.as_deref());
        Self {
            correlation_id: correlation_id.into(),
            status,
            result_code,
            description: description.into(),
            receipt: None,
            amount: None,
            phone: None,
            transaction_date: None,
            source,
            received_at: Utc::now(),
        }
    }

    /// Outcome for a transaction the gateway says is still being processed
    pub fn unknown(
        correlation_id: impl Into<String>,
        description: impl Into<String>,
        source: OutcomeSource,
    ) -> Self {
        let mut outcome = Self::new(correlation_id, None, description, source);
        outcome.status = OutcomeStatus::Unknown;
        outcome
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_are_classified() {
        assert_eq!(OutcomeStatus::from_result_code(Some("0")), OutcomeStatus::Success);
        assert_eq!(OutcomeStatus::from_result_code(Some("1")), OutcomeStatus::Failure);
        assert_eq!(
            OutcomeStatus::from_result_code(Some("1032")),
            OutcomeStatus::Failure
        );
        assert_eq!(
            OutcomeStatus::from_result_code(Some("4999")),
            OutcomeStatus::Unknown
        );
        assert_eq!(
            OutcomeStatus::from_result_code(Some("abc")),
            OutcomeStatus::Unknown
        );
        assert_eq!(OutcomeStatus::from_result_code(None), OutcomeStatus::Unknown);
    }

    #[test]
    fn access_token_debug_is_redacted() {
        let token = AccessToken {
            token: "secret-bearer".to_string(),
            expires_in_secs: 3599,
            issued_at: Utc::now(),
        };
        assert!(!format!("{:?}", token).contains("secret-bearer"));
    }

    #[test]
    fn outcome_builder_sets_receipt() {
        let outcome = PaymentOutcome::new(
            "ws_CO_1",
            Some("0".to_string()),
            "processed",
            OutcomeSource::Webhook,
        )
        .with_receipt("ABC123");
        assert!(outcome.is_success());
        assert_eq!(outcome.receipt.as_deref(), Some("ABC123"));
    }
}
