use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    CreateIntentRequest, CreateRefundRequest, CreatedIntent, GatewayError, IntentSnapshot,
    PaymentGateway, RefundReceipt, INTENT_STATUS_CANCELED, INTENT_STATUS_SUCCEEDED,
};

/// In-process gateway that records every call. Intents stay unpaid until
/// `succeed_intent` is called.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    pub intents: Arc<Mutex<HashMap<String, IntentSnapshot>>>,
    pub intent_requests: Arc<Mutex<Vec<CreateIntentRequest>>>,
    requested_amounts: Arc<Mutex<HashMap<String, i64>>>,
    pub refund_requests: Arc<Mutex<Vec<CreateRefundRequest>>>,
    pub cancelled: Arc<Mutex<Vec<String>>>,
    pub retrieve_calls: Arc<Mutex<usize>>,
    pub fail_create_intent: Arc<Mutex<bool>>,
}

fn make_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an intent as paid in full, as if the customer completed checkout.
    pub fn succeed_intent(&self, intent_ref: &str) {
        let requested = self.requested_amounts.lock().unwrap().get(intent_ref).copied();
        let mut guard = self.intents.lock().unwrap();
        if let Some(intent) = guard.get_mut(intent_ref) {
            intent.status = INTENT_STATUS_SUCCEEDED.to_string();
            intent.captured_amount_minor = requested.unwrap_or(intent.captured_amount_minor);
            intent.latest_charge_ref = Some(make_id("ch_test"));
        }
    }

    pub fn set_intent_status(&self, intent_ref: &str, status: &str) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(intent_ref) {
            intent.status = status.to_string();
        }
    }

    pub fn set_fail_create_intent(&self, fail: bool) {
        *self.fail_create_intent.lock().unwrap() = fail;
    }
}

#[async_trait]
impl PaymentGateway for InMemoryGateway {
    async fn create_intent(
        &self,
        req: CreateIntentRequest,
    ) -> Result<CreatedIntent, GatewayError> {
        if *self.fail_create_intent.lock().unwrap() {
            return Err(GatewayError::Api("intent creation unavailable".into()));
        }

        let intent_ref = make_id("pi_test");
        self.intent_requests.lock().unwrap().push(req.clone());
        self.requested_amounts
            .lock()
            .unwrap()
            .insert(intent_ref.clone(), req.amount_minor);

        let snapshot = IntentSnapshot {
            intent_ref: intent_ref.clone(),
            status: "requires_payment_method".into(),
            captured_amount_minor: 0,
            currency: req.currency.clone(),
            latest_charge_ref: None,
            metadata: req.metadata,
        };
        self.intents
            .lock()
            .unwrap()
            .insert(intent_ref.clone(), snapshot);

        Ok(CreatedIntent {
            client_secret: format!("{}_secret_{}", intent_ref, Uuid::new_v4().simple()),
            intent_ref,
        })
    }

    async fn retrieve_intent(&self, intent_ref: &str) -> Result<IntentSnapshot, GatewayError> {
        *self.retrieve_calls.lock().unwrap() += 1;
        self.intents
            .lock()
            .unwrap()
            .get(intent_ref)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("intent {} not found", intent_ref)))
    }

    async fn cancel_intent(&self, intent_ref: &str) -> Result<(), GatewayError> {
        let mut guard = self.intents.lock().unwrap();
        let intent = guard
            .get_mut(intent_ref)
            .ok_or_else(|| GatewayError::NotFound(format!("intent {} not found", intent_ref)))?;
        if !intent.status.starts_with("requires_") {
            return Err(GatewayError::Api(format!(
                "cannot cancel an intent with status {}",
                intent.status
            )));
        }
        intent.status = INTENT_STATUS_CANCELED.into();
        self.cancelled.lock().unwrap().push(intent_ref.to_string());
        Ok(())
    }

    async fn create_refund(
        &self,
        req: CreateRefundRequest,
    ) -> Result<RefundReceipt, GatewayError> {
        self.refund_requests.lock().unwrap().push(req);
        Ok(RefundReceipt {
            refund_ref: make_id("re_test"),
            status: "succeeded".into(),
        })
    }
}
