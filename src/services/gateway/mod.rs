// NOTE: async-stripe is compiled with only `runtime-tokio-hyper`. PaymentIntent and Refund live in
// the core resource set, so no extra features are needed; anything beyond them requires updating
// Cargo.toml explicitly.
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway api error: {0}")]
    Api(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<stripe::StripeError> for GatewayError {
    fn from(err: stripe::StripeError) -> Self {
        GatewayError::Api(err.to_string())
    }
}

pub const INTENT_STATUS_SUCCEEDED: &str = "succeeded";
pub const INTENT_STATUS_CANCELED: &str = "canceled";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    pub amount_minor: i64,
    pub currency: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatedIntent {
    pub intent_ref: String,
    pub client_secret: String,
}

/// Gateway-side view of a payment intent at retrieval time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntentSnapshot {
    pub intent_ref: String,
    pub status: String,
    pub captured_amount_minor: i64,
    pub currency: String,
    pub latest_charge_ref: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl IntentSnapshot {
    pub fn is_succeeded(&self) -> bool {
        self.status == INTENT_STATUS_SUCCEEDED
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateRefundRequest {
    pub charge_ref: String,
    pub amount_minor: i64,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_ref: String,
    pub status: String,
}

/// External payment gateway. Every call may fail transiently; nothing here
/// commits local state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(&self, req: CreateIntentRequest)
        -> Result<CreatedIntent, GatewayError>;

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentSnapshot, GatewayError>;

    async fn cancel_intent(&self, intent_ref: &str) -> Result<(), GatewayError>;

    async fn create_refund(&self, req: CreateRefundRequest)
        -> Result<RefundReceipt, GatewayError>;
}

mod live;
mod mock;

pub use live::LiveStripeGateway;
pub use mock::InMemoryGateway;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_gateway_tracks_intent_lifecycle() {
        let gateway = InMemoryGateway::new();
        let created = gateway
            .create_intent(CreateIntentRequest {
                amount_minor: 8450,
                currency: "usd".into(),
                metadata: [("user_id".to_string(), "u1".to_string())]
                    .into_iter()
                    .collect(),
            })
            .await
            .unwrap();
        assert!(created.intent_ref.starts_with("pi_test_"));
        assert!(created.client_secret.contains("_secret_"));

        let pending = gateway.retrieve_intent(&created.intent_ref).await.unwrap();
        assert_eq!(pending.status, "requires_payment_method");
        assert_eq!(pending.captured_amount_minor, 0);
        assert_eq!(pending.metadata.get("user_id").map(String::as_str), Some("u1"));

        gateway.succeed_intent(&created.intent_ref);
        let paid = gateway.retrieve_intent(&created.intent_ref).await.unwrap();
        assert!(paid.is_succeeded());
        assert_eq!(paid.captured_amount_minor, 8450);
        assert!(paid.latest_charge_ref.unwrap().starts_with("ch_test_"));
    }

    #[tokio::test]
    async fn in_memory_gateway_unknown_intent_is_not_found() {
        let gateway = InMemoryGateway::new();
        let result = gateway.retrieve_intent("pi_missing").await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn live_retrieve_rejects_malformed_intent_id_before_calling_stripe() {
        let live = LiveStripeGateway::new("sk_test_dummy");
        let result = live.retrieve_intent("ch_not_an_intent").await;
        assert!(matches!(result, Err(GatewayError::Other(_))));
    }

    #[tokio::test]
    async fn live_refund_rejects_malformed_charge_id_before_calling_stripe() {
        let live = LiveStripeGateway::new("sk_test_dummy");
        let result = live
            .create_refund(CreateRefundRequest {
                charge_ref: "pi_wrong_kind".into(),
                amount_minor: 100,
                metadata: BTreeMap::new(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Other(_))));
    }

    #[tokio::test]
    async fn live_intent_rejects_unknown_currency() {
        let live = LiveStripeGateway::new("sk_test_dummy");
        let result = live
            .create_intent(CreateIntentRequest {
                amount_minor: 100,
                currency: "not-a-currency".into(),
                metadata: BTreeMap::new(),
            })
            .await;
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
