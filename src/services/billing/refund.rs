use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::db::billing_repository::BillingRepository;
use crate::models::{
    payment::Payment,
    plan_change::{PlanChange, PlanChangeState},
};
use crate::services::billing::{
    cycle::CycleWindow,
    ledger::{refund_entry, Ledger},
    proration::unused_credit,
};
use crate::services::gateway::{CreateRefundRequest, PaymentGateway};
use crate::utils::money::to_minor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefundOutcome {
    Refunded {
        refund_ref: String,
        amount_minor: i64,
    },
    Failed {
        reason: String,
    },
    /// Nothing was owed, or another call already handled the refund.
    Skipped,
}

/// Returns unused days of a superseded cycle after a downgrade settles.
/// Best effort: a failure is recorded but never undoes the plan change.
#[derive(Clone)]
pub struct RefundProcessor {
    billing: Arc<dyn BillingRepository>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: Ledger,
}

impl RefundProcessor {
    pub fn new(
        billing: Arc<dyn BillingRepository>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Ledger,
    ) -> Self {
        Self {
            billing,
            gateway,
            ledger,
        }
    }

    /// `change` must be settled; `payment` is the charge that settled it.
    /// Calling again after a failed start retries; a refund already under way
    /// or finished is `Skipped`.
    pub async fn process(&self, change: &PlanChange, payment: &Payment) -> RefundOutcome {
        // Prior cycle, measured at the instant the change was priced.
        let window =
            CycleWindow::between(change.cycle_start, change.cycle_end, change.effective_at);
        let credit = unused_credit(change.old_price, &window);
        let amount_minor = to_minor(credit).min(change.prior_captured_minor);

        match self
            .billing
            .transition_plan_change(
                change.id,
                PlanChangeState::Settled,
                PlanChangeState::RefundPending,
                None,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => return RefundOutcome::Skipped,
            Err(err) => {
                error!(?err, plan_change_id = %change.id, "could not mark refund pending");
                let reason = "refund could not be started".to_string();
                self.ledger
                    .append_after_charge(
                        refund_entry(
                            change,
                            credit,
                            window.remaining_days,
                            payment.id,
                            0,
                            None,
                            format!(
                                "refund of {amount_minor} minor units not started; \
                                 retried on next confirmation"
                            ),
                        ),
                        payment.gateway_intent_ref.as_deref(),
                    )
                    .await;
                return RefundOutcome::Failed { reason };
            }
        }

        if amount_minor <= 0 {
            self.finish(
                change,
                PlanChangeState::RefundSettled,
                None,
                "no refundable credit",
            )
            .await;
            return RefundOutcome::Skipped;
        }

        let result = match change.prior_charge_ref.as_deref() {
            None => Err("prior charge has no gateway reference".to_string()),
            Some(charge_ref) => {
                let metadata: BTreeMap<String, String> = [
                    ("user_id".to_string(), change.user_id.to_string()),
                    ("plan_change_id".to_string(), change.id.to_string()),
                    ("payment_id".to_string(), payment.id.to_string()),
                ]
                .into_iter()
                .collect();
                self.gateway
                    .create_refund(CreateRefundRequest {
                        charge_ref: charge_ref.to_string(),
                        amount_minor,
                        metadata,
                    })
                    .await
                    .map(|receipt| receipt.refund_ref)
                    .map_err(|err| {
                        warn!(
                            ?err,
                            user_id = %change.user_id,
                            plan_change_id = %change.id,
                            charge_ref,
                            amount_minor,
                            "partial refund request failed"
                        );
                        err.to_string()
                    })
            }
        };

        let (outcome, state, refund_ref, refunded, note) = match result {
            Ok(refund_ref) => (
                RefundOutcome::Refunded {
                    refund_ref: refund_ref.clone(),
                    amount_minor,
                },
                PlanChangeState::RefundSettled,
                Some(refund_ref),
                amount_minor,
                format!("refunded {amount_minor} minor units of the superseded cycle"),
            ),
            Err(reason) => (
                RefundOutcome::Failed {
                    reason: reason.clone(),
                },
                PlanChangeState::RefundFailed,
                None,
                0,
                format!("refund of {amount_minor} minor units failed: {reason}"),
            ),
        };

        self.finish(change, state, refund_ref.as_deref(), &note).await;
        self.ledger
            .append_after_charge(
                refund_entry(
                    change,
                    credit,
                    window.remaining_days,
                    payment.id,
                    refunded,
                    refund_ref,
                    note,
                ),
                payment.gateway_intent_ref.as_deref(),
            )
            .await;

        info!(
            user_id = %change.user_id,
            plan_change_id = %change.id,
            refunded_minor = refunded,
            state = state.as_str(),
            "downgrade refund processed"
        );
        outcome
    }

    async fn finish(
        &self,
        change: &PlanChange,
        state: PlanChangeState,
        refund_ref: Option<&str>,
        note: &str,
    ) {
        if let Err(err) = self
            .billing
            .complete_refund(change.id, state, refund_ref, Some(note))
            .await
        {
            error!(
                ?err,
                plan_change_id = %change.id,
                user_id = %change.user_id,
                refund_ref,
                state = state.as_str(),
                "could not record refund outcome on plan change"
            );
        }
    }
}
