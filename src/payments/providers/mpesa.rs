//! M-PESA Daraja STK push client
//!
//! Covers the three calls the shop needs: OAuth token generation, the
//! Lipa na M-PESA Online prompt and the synchronous prompt query.

use crate::logging::mask_phone;
use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::provider::PaymentGatewayClient;
use crate::payments::types::{AccessToken, InitiatedPayment, OutcomeSource, PaymentOutcome};
use crate::payments::utils::{to_whole_units, GatewayHttpClient, GatewayReply, HttpAuth};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value as JsonValue};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

/// Query error code Daraja returns while the payer has not answered the prompt yet
const STILL_PROCESSING_ERROR_CODE: &str = "500.001.1001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => SANDBOX_BASE_URL,
            MpesaEnvironment::Production => PRODUCTION_BASE_URL,
        }
    }
}

#[derive(Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub environment: MpesaEnvironment,
    pub base_url: String,
    pub callback_url: String,
    /// Shared secret appended to the callback URL as `?token=`
    pub callback_token: Option<String>,
    pub account_reference: String,
    pub auth_timeout_secs: u64,
    pub initiate_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub token_ttl_secs: u64,
}

impl fmt::Debug for MpesaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpesaConfig")
            .field("shortcode", &self.shortcode)
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("callback_url", &self.callback_url)
            .field("account_reference", &self.account_reference)
            .field("callback_token", &self.callback_token.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

fn env_secs(name: &str, default: u64) -> GatewayResult<u64> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| GatewayError::Validation {
            message: format!("{} must be a whole number of seconds", name),
            field: Some(name.to_string()),
        }),
        Err(_) => Ok(default),
    }
}

impl MpesaConfig {
    pub fn from_env() -> GatewayResult<Self> {
        let required = |name: &str| -> GatewayResult<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| GatewayError::Validation {
                    message: format!("{} is required", name),
                    field: Some(name.to_string()),
                })
        };

        let environment = match std::env::var("MPESA_ENV")
            .unwrap_or_else(|_| "sandbox".to_string())
            .to_lowercase()
            .as_str()
        {
            "sandbox" => MpesaEnvironment::Sandbox,
            "production" | "live" => MpesaEnvironment::Production,
            other => {
                return Err(GatewayError::Validation {
                    message: format!("unsupported MPESA_ENV: {}", other),
                    field: Some("MPESA_ENV".to_string()),
                })
            }
        };

        let base_url = std::env::var("MPESA_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| environment.base_url().to_string());

        let config = Self {
            consumer_key: required("MPESA_CONSUMER_KEY")?,
            consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            shortcode: required("MPESA_SHORTCODE")?,
            passkey: required("MPESA_PASSKEY")?,
            environment,
            base_url: base_url.trim_end_matches('/').to_string(),
            callback_url: required("MPESA_CALLBACK_URL")?,
            callback_token: std::env::var("MPESA_CALLBACK_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            account_reference: std::env::var("MPESA_ACCOUNT_REFERENCE")
                .unwrap_or_else(|_| "Great Below".to_string()),
            auth_timeout_secs: env_secs("MPESA_AUTH_TIMEOUT_SECS", 5)?,
            initiate_timeout_secs: env_secs("MPESA_INITIATE_TIMEOUT_SECS", 8)?,
            query_timeout_secs: env_secs("MPESA_QUERY_TIMEOUT_SECS", 12)?,
            token_ttl_secs: env_secs("MPESA_TOKEN_TTL_SECS", 3000)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if !self.callback_url.starts_with("http://") && !self.callback_url.starts_with("https://")
        {
            return Err(GatewayError::Validation {
                message: "MPESA_CALLBACK_URL must be an http(s) URL".to_string(),
                field: Some("MPESA_CALLBACK_URL".to_string()),
            });
        }
        if self.auth_timeout_secs == 0
            || self.initiate_timeout_secs == 0
            || self.query_timeout_secs == 0
        {
            return Err(GatewayError::Validation {
                message: "M-PESA timeouts must be greater than zero".to_string(),
                field: None,
            });
        }
        Ok(())
    }

    /// Callback URL sent to Daraja, carrying the shared token when one is configured
    pub fn effective_callback_url(&self) -> String {
        match &self.callback_token {
            Some(token) => {
                let separator = if self.callback_url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.callback_url, separator, token)
            }
            None => self.callback_url.clone(),
        }
    }
}

fn msisdn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^254\d{9}$").expect("msisdn pattern compiles"))
}

/// Normalize a Kenyan phone number to `254XXXXXXXXX`.
///
/// Spaces, dashes and a leading `+` are stripped; a leading `0` becomes
/// `254`; a number without the country prefix gets it prepended.
pub fn normalize_msisdn(phone: &str) -> GatewayResult<String> {
    let digits: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '+' && *c != '-')
        .collect();

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.starts_with("254") {
        digits
    } else {
        format!("254{}", digits)
    };

    if msisdn_pattern().is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(GatewayError::InvalidPhoneFormat {
            phone: phone.to_string(),
        })
    }
}

/// `YYYYMMDDHHMMSS` in East Africa Time (UTC+3, no daylight saving)
pub fn eat_timestamp(now: DateTime<Utc>) -> String {
    (now.naive_utc() + TimeDelta::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// STK password: base64(shortcode + passkey + timestamp)
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{}{}{}", shortcode, passkey, timestamp))
}

/// Daraja sends codes both as strings and as numbers
fn code_field(body: &JsonValue, key: &str) -> Option<String> {
    match body.get(key)? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_field(body: &JsonValue, key: &str) -> Option<String> {
    body.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

struct CachedToken {
    token: AccessToken,
    valid_until: DateTime<Utc>,
}

pub struct MpesaClient {
    config: MpesaConfig,
    http: GatewayHttpClient,
    token_cache: RwLock<Option<CachedToken>>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> GatewayResult<Self> {
        Ok(Self {
            config,
            http: GatewayHttpClient::new()?,
            token_cache: RwLock::new(None),
        })
    }

    pub fn from_env() -> GatewayResult<Self> {
        Self::new(MpesaConfig::from_env()?)
    }

    pub fn config(&self) -> &MpesaConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn bearer_token(&self) -> GatewayResult<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.valid_until > Utc::now() {
                    return Ok(cached.token.token.clone());
                }
            }
        }

        Ok(self.authenticate().await?.token)
    }

    async fn evict_token(&self) {
        let mut cache = self.token_cache.write().await;
        *cache = None;
    }

    /// Map a non-success reply from initiate/query to a gateway error.
    async fn reply_error(&self, reply: &GatewayReply, operation: &str) -> GatewayError {
        let code = code_field(&reply.body, "errorCode");
        let message = text_field(&reply.body, "errorMessage")
            .or_else(|| text_field(&reply.body, "ResponseDescription"))
            .unwrap_or_else(|| format!("{} returned HTTP {}", operation, reply.status));

        match reply.status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                self.evict_token().await;
                GatewayError::Auth { message }
            }
            status if status.is_client_error() => GatewayError::Business { code, message },
            _ => GatewayError::Transport {
                message: format!("{} failed with HTTP {}: {}", operation, reply.status, message),
            },
        }
    }
}

/// Parse a Lipa na M-PESA Online result callback.
///
/// Metadata items are looked up by `Name`; the list is absent on failures.
pub fn parse_stk_callback(payload: &JsonValue) -> GatewayResult<PaymentOutcome> {
    let callback = payload
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .ok_or_else(|| GatewayError::InvalidResponse {
            message: "callback has no Body.stkCallback".to_string(),
        })?;

    let correlation_id = text_field(callback, "CheckoutRequestID")
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| GatewayError::InvalidResponse {
            message: "callback has no CheckoutRequestID".to_string(),
        })?;

    let mut outcome = PaymentOutcome::new(
        correlation_id,
        code_field(callback, "ResultCode"),
        text_field(callback, "ResultDesc").unwrap_or_default(),
        OutcomeSource::Webhook,
    );

    let items = callback
        .get("CallbackMetadata")
        .and_then(|m| m.get("Item"))
        .and_then(|i| i.as_array());

    for item in items.into_iter().flatten() {
        let Some(name) = item.get("Name").and_then(|n| n.as_str()) else {
            continue;
        };
        match name {
            "MpesaReceiptNumber" => outcome.receipt = code_field(item, "Value"),
            "Amount" => {
                outcome.amount = code_field(item, "Value").and_then(|v| v.parse().ok())
            }
            "TransactionDate" => outcome.transaction_date = code_field(item, "Value"),
            "PhoneNumber" => outcome.phone = code_field(item, "Value"),
            _ => {}
        }
    }

    Ok(outcome)
}

#[async_trait]
impl PaymentGatewayClient for MpesaClient {
    async fn authenticate(&self) -> GatewayResult<AccessToken> {
        let url = self.url("/oauth/v1/generate?grant_type=client_credentials");
        let reply = self
            .http
            .send_json(
                Method::GET,
                &url,
                HttpAuth::Basic {
                    username: &self.config.consumer_key,
                    password: &self.config.consumer_secret,
                },
                None,
                Duration::from_secs(self.config.auth_timeout_secs),
                "authenticate",
            )
            .await?;

        if reply.status.is_server_error() {
            return Err(GatewayError::Transport {
                message: format!("token endpoint returned HTTP {}", reply.status),
            });
        }
        if !reply.status.is_success() {
            warn!(status = %reply.status, "M-PESA rejected client credentials");
            return Err(GatewayError::Auth {
                message: format!("token endpoint returned HTTP {}", reply.status),
            });
        }

        let token = text_field(&reply.body, "access_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::Auth {
                message: "token endpoint response had no access_token".to_string(),
            })?;
        let expires_in_secs = code_field(&reply.body, "expires_in")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3599);

        let access_token = AccessToken {
            token,
            expires_in_secs,
            issued_at: Utc::now(),
        };

        let ttl = self.config.token_ttl_secs.min(expires_in_secs);
        let valid_until = access_token.issued_at + TimeDelta::seconds(ttl as i64);
        *self.token_cache.write().await = Some(CachedToken {
            token: access_token.clone(),
            valid_until,
        });

        debug!(expires_in_secs, "M-PESA access token refreshed");
        Ok(access_token)
    }

    async fn initiate_payment(
        &self,
        phone: &str,
        amount: &BigDecimal,
        order_code: &str,
    ) -> GatewayResult<InitiatedPayment> {
        let normalized_phone = normalize_msisdn(phone)?;
        let amount_units = to_whole_units(amount)?;
        let token = self.bearer_token().await?;

        let timestamp = eat_timestamp(Utc::now());
        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": stk_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "TransactionType": "CustomerPayBillOnline",
            "Amount": amount_units,
            "PartyA": normalized_phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": normalized_phone,
            "CallBackURL": self.config.effective_callback_url(),
            "AccountReference": format!("{}_{}", self.config.account_reference, order_code),
            "TransactionDesc": format!("Payment for order {}", order_code),
        });

        info!(
            order_code = %order_code,
            phone = %mask_phone(&normalized_phone),
            amount = amount_units,
            "Sending M-PESA STK push"
        );

        let reply = self
            .http
            .send_json(
                Method::POST,
                &self.url("/mpesa/stkpush/v1/processrequest"),
                HttpAuth::Bearer(&token),
                Some(&payload),
                Duration::from_secs(self.config.initiate_timeout_secs),
                "initiate",
            )
            .await?;

        if !reply.status.is_success() {
            return Err(self.reply_error(&reply, "initiate").await);
        }

        let response_code = code_field(&reply.body, "ResponseCode");
        if response_code.as_deref() != Some("0") {
            return Err(GatewayError::Business {
                message: text_field(&reply.body, "ResponseDescription")
                    .or_else(|| text_field(&reply.body, "errorMessage"))
                    .unwrap_or_else(|| "STK push was not accepted".to_string()),
                code: response_code,
            });
        }

        let correlation_id = text_field(&reply.body, "CheckoutRequestID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::InvalidResponse {
                message: "accepted STK push carried no CheckoutRequestID".to_string(),
            })?;

        Ok(InitiatedPayment {
            correlation_id,
            merchant_request_id: text_field(&reply.body, "MerchantRequestID"),
            customer_message: text_field(&reply.body, "CustomerMessage")
                .unwrap_or_else(|| "Check your phone to complete the payment".to_string()),
            normalized_phone,
        })
    }

    async fn query_status(&self, correlation_id: &str) -> GatewayResult<PaymentOutcome> {
        let token = self.bearer_token().await?;
        let timestamp = eat_timestamp(Utc::now());
        let payload = json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": stk_password(&self.config.shortcode, &self.config.passkey, &timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": correlation_id,
        });

        let reply = self
            .http
            .send_json(
                Method::POST,
                &self.url("/mpesa/stkpushquery/v1/query"),
                HttpAuth::Bearer(&token),
                Some(&payload),
                Duration::from_secs(self.config.query_timeout_secs),
                "query",
            )
            .await?;

        if !reply.status.is_success() {
            if code_field(&reply.body, "errorCode").as_deref() == Some(STILL_PROCESSING_ERROR_CODE)
            {
                debug!(correlation_id = %correlation_id, "M-PESA transaction still processing");
                return Ok(PaymentOutcome::unknown(
                    correlation_id,
                    text_field(&reply.body, "errorMessage")
                        .unwrap_or_else(|| "The transaction is being processed".to_string()),
                    OutcomeSource::Poll,
                ));
            }
            return Err(self.reply_error(&reply, "query").await);
        }

        let description = text_field(&reply.body, "ResultDesc")
            .or_else(|| text_field(&reply.body, "ResponseDescription"))
            .unwrap_or_default();

        Ok(PaymentOutcome::new(
            correlation_id,
            code_field(&reply.body, "ResultCode"),
            description,
            OutcomeSource::Poll,
        ))
    }

    fn name(&self) -> &'static str {
        "mpesa"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn phone_numbers_are_normalized() {
        assert_eq!(normalize_msisdn("0712345678").unwrap(), "254712345678");
        assert_eq!(normalize_msisdn("+254 712 345 678").unwrap(), "254712345678");
        assert_eq!(normalize_msisdn("712345678").unwrap(), "254712345678");
        assert_eq!(normalize_msisdn("254712345678").unwrap(), "254712345678");
    }

    #[test]
    fn malformed_phone_numbers_are_rejected() {
        for phone in ["12345", "07123456789", "0712abc678", ""] {
            assert!(
                matches!(
                    normalize_msisdn(phone),
                    Err(GatewayError::InvalidPhoneFormat { .. })
                ),
                "{} should be rejected",
                phone
            );
        }
    }

    #[test]
    fn timestamp_is_east_africa_time() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 22, 15, 9).unwrap();
        assert_eq!(eat_timestamp(now), "20260302011509");
    }

    #[test]
    fn password_is_base64_of_concatenation() {
        let password = stk_password("174379", "passkey", "20260101120000");
        let decoded = STANDARD.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey20260101120000");
    }

    #[test]
    fn callback_token_is_appended() {
        let mut config = MpesaConfig {
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            shortcode: "174379".to_string(),
            passkey: "passkey".to_string(),
            environment: MpesaEnvironment::Sandbox,
            base_url: SANDBOX_BASE_URL.to_string(),
            callback_url: "https://shop.example/api/payments/mpesa/callback".to_string(),
            callback_token: None,
            account_reference: "Great Below".to_string(),
            auth_timeout_secs: 5,
            initiate_timeout_secs: 8,
            query_timeout_secs: 12,
            token_ttl_secs: 3000,
        };
        assert_eq!(config.effective_callback_url(), config.callback_url);

        config.callback_token = Some("s3cret".to_string());
        assert_eq!(
            config.effective_callback_url(),
            "https://shop.example/api/payments/mpesa/callback?token=s3cret"
        );
        assert!(!format!("{:?}", config).contains("s3cret"));
    }

    #[test]
    fn codes_are_read_from_strings_and_numbers() {
        let body = json!({"ResultCode": 1032, "ResponseCode": "0"});
        assert_eq!(code_field(&body, "ResultCode").as_deref(), Some("1032"));
        assert_eq!(code_field(&body, "ResponseCode").as_deref(), Some("0"));
        assert_eq!(code_field(&body, "Missing"), None);
    }

    #[test]
    fn success_callback_metadata_is_scanned_by_name() {
        let payload = json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": 500.00},
                    {"Name": "TransactionDate", "Value": 20191219102115u64},
                    {"Name": "MpesaReceiptNumber", "Value": "ABC123"},
                    {"Name": "Balance"},
                    {"Name": "PhoneNumber", "Value": 254708374149u64}
                ]}
            }}
        });

        let outcome = parse_stk_callback(&payload).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.correlation_id, "ws_CO_191220191020363925");
        assert_eq!(outcome.receipt.as_deref(), Some("ABC123"));
        assert_eq!(outcome.phone.as_deref(), Some("254708374149"));
        assert_eq!(outcome.transaction_date.as_deref(), Some("20191219102115"));
        assert_eq!(outcome.amount, Some(BigDecimal::from(500)));
        assert_eq!(outcome.source, OutcomeSource::Webhook);
    }

    #[test]
    fn failure_callback_has_no_metadata() {
        let payload = json!({
            "Body": {"stkCallback": {
                "CheckoutRequestID": "ws_CO_1",
                "ResultCode": 1,
                "ResultDesc": "The balance is insufficient for the transaction."
            }}
        });

        let outcome = parse_stk_callback(&payload).unwrap();
        assert_eq!(outcome.status, crate::payments::types::OutcomeStatus::Failure);
        assert_eq!(outcome.result_code.as_deref(), Some("1"));
        assert_eq!(outcome.receipt, None);
    }

    #[test]
    fn callback_without_checkout_id_is_invalid() {
        assert!(parse_stk_callback(&json!({"Body": {"stkCallback": {"ResultCode": 0}}})).is_err());
        assert!(parse_stk_callback(&json!({"hello": "world"})).is_err());
    }
}
