use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use super::{
    CreateIntentRequest, CreateRefundRequest, CreatedIntent, GatewayError, IntentSnapshot,
    PaymentGateway, RefundReceipt,
};

pub struct LiveStripeGateway {
    client: stripe::Client,
}

impl LiveStripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    pub fn from_settings(settings: &crate::config::StripeSettings) -> Self {
        Self::new(settings.secret_key.clone())
    }
}

fn parse_currency(raw: &str) -> Result<stripe::Currency, GatewayError> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
        .map_err(|_| GatewayError::Config(format!("unsupported currency: {raw}")))
}

// Stripe objects are read through their JSON form so the mapping does not depend on
// which fields the generated structs mark optional.
fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn extract_str(val: &Value, path: &[&str]) -> Option<String> {
    jget(val, path)?.as_str().map(|s| s.to_string())
}

fn extract_metadata(val: &Value) -> BTreeMap<String, String> {
    jget(val, &["metadata"])
        .and_then(|m| m.as_object())
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn snapshot_from_json(raw: &Value) -> Result<IntentSnapshot, GatewayError> {
    let intent_ref = extract_str(raw, &["id"])
        .ok_or_else(|| GatewayError::Serde("payment intent without id".into()))?;
    // latest_charge is either an id or an expanded charge object
    let latest_charge_ref =
        extract_str(raw, &["latest_charge"]).or_else(|| extract_str(raw, &["latest_charge", "id"]));

    Ok(IntentSnapshot {
        intent_ref,
        status: extract_str(raw, &["status"]).unwrap_or_else(|| "unknown".to_string()),
        captured_amount_minor: jget(raw, &["amount_received"])
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        currency: extract_str(raw, &["currency"]).unwrap_or_default(),
        latest_charge_ref,
        metadata: extract_metadata(raw),
    })
}

fn parse_intent_id(intent_ref: &str) -> Result<stripe::PaymentIntentId, GatewayError> {
    intent_ref
        .parse::<stripe::PaymentIntentId>()
        .map_err(|e| GatewayError::Other(e.to_string()))
}

#[async_trait]
impl PaymentGateway for LiveStripeGateway {
    async fn create_intent(
        &self,
        req: CreateIntentRequest,
    ) -> Result<CreatedIntent, GatewayError> {
        let currency = parse_currency(&req.currency)?;
        let mut params = stripe::CreatePaymentIntent::new(req.amount_minor, currency);
        if !req.metadata.is_empty() {
            params.metadata = Some(req.metadata.into_iter().collect());
        }

        let intent = stripe::PaymentIntent::create(&self.client, params).await?;
        let client_secret = intent
            .client_secret
            .clone()
            .ok_or_else(|| GatewayError::Other("payment intent has no client secret".into()))?;
        Ok(CreatedIntent {
            intent_ref: intent.id.to_string(),
            client_secret,
        })
    }

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentSnapshot, GatewayError> {
        let id = parse_intent_id(intent_ref)?;
        let intent = stripe::PaymentIntent::retrieve(&self.client, &id, &[]).await?;
        let raw =
            serde_json::to_value(&intent).map_err(|e| GatewayError::Serde(e.to_string()))?;
        snapshot_from_json(&raw)
    }

    async fn cancel_intent(&self, intent_ref: &str) -> Result<(), GatewayError> {
        let id = parse_intent_id(intent_ref)?;
        stripe::PaymentIntent::cancel(&self.client, &id, Default::default()).await?;
        Ok(())
    }

    async fn create_refund(
        &self,
        req: CreateRefundRequest,
    ) -> Result<RefundReceipt, GatewayError> {
        let charge = req
            .charge_ref
            .parse::<stripe::ChargeId>()
            .map_err(|e| GatewayError::Other(e.to_string()))?;
        let mut params = stripe::CreateRefund::new();
        params.charge = Some(charge);
        params.amount = Some(req.amount_minor);
        if !req.metadata.is_empty() {
            params.metadata = Some(req.metadata.into_iter().collect());
        }

        let refund = stripe::Refund::create(&self.client, params).await?;
        let raw =
            serde_json::to_value(&refund).map_err(|e| GatewayError::Serde(e.to_string()))?;
        Ok(RefundReceipt {
            refund_ref: refund.id.to_string(),
            status: extract_str(&raw, &["status"]).unwrap_or_else(|| "pending".to_string()),
        })
    }
}
