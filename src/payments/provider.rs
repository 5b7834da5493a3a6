use crate::payments::error::GatewayResult;
use crate::payments::types::{AccessToken, InitiatedPayment, PaymentOutcome};
use async_trait::async_trait;
use bigdecimal::BigDecimal;

/// Contract of a mobile-money gateway that can prompt a payer and report the result.
///
/// Implementations never retry on their own; callers decide what is safe to repeat.
#[async_trait]
pub trait PaymentGatewayClient: Send + Sync {
    /// Fetch a fresh bearer token.
    async fn authenticate(&self) -> GatewayResult<AccessToken>;

    /// Ask the gateway to prompt `phone` for `amount`, tagged with `order_code`.
    async fn initiate_payment(
        &self,
        phone: &str,
        amount: &BigDecimal,
        order_code: &str,
    ) -> GatewayResult<InitiatedPayment>;

    /// Synchronously query the result of an earlier prompt.
    async fn query_status(&self, correlation_id: &str) -> GatewayResult<PaymentOutcome>;

    fn name(&self) -> &'static str;
}
