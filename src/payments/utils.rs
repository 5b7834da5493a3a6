use crate::payments::error::{GatewayError, GatewayResult};
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value as JsonValue;
use std::time::Duration;

/// Authentication applied to one outbound request
pub enum HttpAuth<'a> {
    Basic { username: &'a str, password: &'a str },
    Bearer(&'a str),
}

/// Raw gateway reply; the body is parsed JSON or `Null` when it was not JSON
#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub status: StatusCode,
    pub body: JsonValue,
}

/// Thin reqwest wrapper with per-call timeouts and no retries
#[derive(Clone)]
pub struct GatewayHttpClient {
    client: Client,
}

impl GatewayHttpClient {
    pub fn new() -> GatewayResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport {
                message: format!("failed to initialize HTTP client: {}", e),
            })?;

        Ok(Self { client })
    }

    /// Send one request and return the status with the decoded body.
    ///
    /// Timeouts become [`GatewayError::Timeout`] tagged with `operation`; other
    /// send failures become [`GatewayError::Transport`]. Non-2xx statuses are
    /// returned to the caller, which knows the gateway's error shapes.
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        auth: HttpAuth<'_>,
        body: Option<&JsonValue>,
        timeout: Duration,
        operation: &str,
    ) -> GatewayResult<GatewayReply> {
        let mut request = self.client.request(method, url).timeout(timeout);

        request = match auth {
            HttpAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
            HttpAuth::Bearer(token) => request.bearer_auth(token),
        };

        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    operation: operation.to_string(),
                    timeout_secs: timeout.as_secs(),
                }
            } else {
                GatewayError::Transport {
                    message: format!("{} request failed: {}", operation, e),
                }
            }
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout {
                    operation: operation.to_string(),
                    timeout_secs: timeout.as_secs(),
                }
            } else {
                GatewayError::Transport {
                    message: format!("{} response could not be read: {}", operation, e),
                }
            }
        })?;

        let body = serde_json::from_str(&text).unwrap_or(JsonValue::Null);
        Ok(GatewayReply { status, body })
    }
}

/// Round a shilling amount half-up to whole units for the gateway.
///
/// Amounts under one shilling after rounding are rejected.
pub fn to_whole_units(amount: &BigDecimal) -> GatewayResult<i64> {
    let rounded = amount.with_scale_round(0, RoundingMode::HalfUp);
    let units = rounded.to_i64().ok_or_else(|| GatewayError::Validation {
        message: format!("amount {} is out of range", amount),
        field: Some("amount".to_string()),
    })?;

    if units < 1 {
        return Err(GatewayError::Validation {
            message: format!("amount {} rounds to less than 1", amount),
            field: Some("amount".to_string()),
        });
    }

    Ok(units)
}

/// Constant-time byte comparison
pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Hex SHA-256 of a payload, used to correlate callback bodies in logs
pub fn payload_fingerprint(payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(payload);
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn secure_eq_behaves_correctly() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"ab"));
    }

    #[test]
    fn amounts_round_half_up() {
        let cases = [("500.00", 500), ("500.49", 500), ("500.50", 501), ("1.00", 1)];
        for (input, expected) in cases {
            let amount = BigDecimal::from_str(input).unwrap();
            assert_eq!(to_whole_units(&amount).unwrap(), expected, "input {}", input);
        }
    }

    #[test]
    fn sub_unit_amounts_are_rejected() {
        let amount = BigDecimal::from_str("0.40").unwrap();
        assert!(matches!(
            to_whole_units(&amount),
            Err(GatewayError::Validation { .. })
        ));

        let negative = BigDecimal::from_str("-5").unwrap();
        assert!(to_whole_units(&negative).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = payload_fingerprint(br#"{"Body":{}}"#);
        let b = payload_fingerprint(br#"{"Body":{}}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }
}
