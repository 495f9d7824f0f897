use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::{
    billing_repository::{AssignmentOutcome, BillingRepository, PlanAssignment},
    user_repository::UserRepository,
};
use crate::models::{
    billing_cycle::BillingCycle,
    payment::{Payment, PaymentStatus},
    plan_change::{PlanChange, PlanChangeState},
    plan_history::PlanAction,
    user::User,
};
use crate::services::billing::{
    catalog::PlanCatalog,
    cycle::add_one_month,
    error::BillingError,
    refund::{RefundOutcome, RefundProcessor},
};
use crate::services::gateway::{IntentSnapshot, PaymentGateway};
use crate::utils::money::{from_minor, to_minor};

/// What the gateway actually captured for a change.
#[derive(Debug, Clone)]
pub struct CapturedCharge {
    pub amount_minor: i64,
    pub currency: String,
    pub charge_ref: Option<String>,
    pub intent_ref: Option<String>,
}

impl CapturedCharge {
    pub fn from_snapshot(snapshot: &IntentSnapshot) -> Self {
        Self {
            amount_minor: snapshot.captured_amount_minor,
            currency: snapshot.currency.clone(),
            charge_ref: snapshot.latest_charge_ref.clone(),
            intent_ref: Some(snapshot.intent_ref.clone()),
        }
    }

    /// Zero-amount changes never reach the gateway.
    pub fn free(currency: &str) -> Self {
        Self {
            amount_minor: 0,
            currency: currency.to_string(),
            charge_ref: None,
            intent_ref: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub user: User,
    pub payment: Option<Payment>,
    /// `None` unless this call settled a mid-cycle downgrade.
    pub refund: Option<RefundOutcome>,
    /// True when the change had already been settled by an earlier call.
    pub repeated: bool,
}

#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// The intent has not succeeded yet. Nothing was written.
    Pending { status: String },
    Settled(Settlement),
}

#[derive(Clone)]
pub struct SettlementConfirmer {
    users: Arc<dyn UserRepository>,
    billing: Arc<dyn BillingRepository>,
    catalog: PlanCatalog,
    gateway: Arc<dyn PaymentGateway>,
    refunds: RefundProcessor,
}

impl SettlementConfirmer {
    pub fn new(
        users: Arc<dyn UserRepository>,
        billing: Arc<dyn BillingRepository>,
        catalog: PlanCatalog,
        gateway: Arc<dyn PaymentGateway>,
        refunds: RefundProcessor,
    ) -> Self {
        Self {
            users,
            billing,
            catalog,
            gateway,
            refunds,
        }
    }

    /// Safe to call repeatedly for the same intent: polling before payment
    /// writes nothing, and a settled change is never charged twice.
    pub async fn confirm(
        &self,
        caller: Uuid,
        intent_ref: &str,
    ) -> Result<ConfirmOutcome, BillingError> {
        let snapshot = self.gateway.retrieve_intent(intent_ref).await?;

        if let Some(owner) = snapshot.metadata.get("user_id") {
            if owner != &caller.to_string() {
                return Err(BillingError::Validation(
                    "payment intent belongs to another user".into(),
                ));
            }
        }

        if !snapshot.is_succeeded() {
            return Ok(ConfirmOutcome::Pending {
                status: snapshot.status,
            });
        }

        let change = self.locate_change(&snapshot).await?;
        if change.user_id != caller {
            return Err(BillingError::Validation(
                "payment intent belongs to another user".into(),
            ));
        }

        match change.state {
            state if state.is_settled() => self.repeat(&change).await.map(ConfirmOutcome::Settled),
            PlanChangeState::Abandoned => {
                error!(
                    user_id = %change.user_id,
                    plan_change_id = %change.id,
                    intent_ref,
                    captured_minor = snapshot.captured_amount_minor,
                    "gateway captured a charge for an abandoned plan change"
                );
                Err(BillingError::SettlementInconsistency(format!(
                    "intent {intent_ref} was paid after its plan change was abandoned"
                )))
            }
            _ => self
                .settle(change, CapturedCharge::from_snapshot(&snapshot))
                .await
                .map(ConfirmOutcome::Settled),
        }
    }

    async fn locate_change(&self, snapshot: &IntentSnapshot) -> Result<PlanChange, BillingError> {
        let by_metadata = match snapshot
            .metadata
            .get("plan_change_id")
            .and_then(|raw| Uuid::parse_str(raw).ok())
        {
            Some(id) => self.billing.find_plan_change(id).await?,
            None => None,
        };
        let change = match by_metadata {
            Some(change) => Some(change),
            None => {
                self.billing
                    .find_plan_change_by_intent(&snapshot.intent_ref)
                    .await?
            }
        };

        change.ok_or_else(|| {
            error!(
                intent_ref = %snapshot.intent_ref,
                captured_minor = snapshot.captured_amount_minor,
                metadata = ?snapshot.metadata,
                "succeeded intent has no matching plan change"
            );
            BillingError::SettlementInconsistency(format!(
                "no plan change recorded for intent {}",
                snapshot.intent_ref
            ))
        })
    }

    /// Reports an already-settled change. A downgrade refund that never got
    /// past `settled` is started again here.
    async fn repeat(&self, change: &PlanChange) -> Result<Settlement, BillingError> {
        let user = self
            .users
            .find_user_by_id(change.user_id)
            .await?
            .ok_or(BillingError::UserNotFound(change.user_id))?;
        let current = self
            .billing
            .find_plan_change(change.id)
            .await?
            .unwrap_or_else(|| change.clone());
        let payment = match current.payment_id {
            Some(id) => self.billing.find_payment(id).await?,
            None => None,
        };
        info!(
            user_id = %current.user_id,
            plan_change_id = %current.id,
            state = current.state.as_str(),
            "plan change already settled"
        );

        let refund = match &payment {
            Some(payment)
                if current.state == PlanChangeState::Settled && owes_refund(&current) =>
            {
                info!(
                    user_id = %current.user_id,
                    plan_change_id = %current.id,
                    refund_due_minor = current.refund_due_minor,
                    "retrying downgrade refund"
                );
                Some(self.refunds.process(&current, payment).await)
            }
            _ => None,
        };

        Ok(Settlement {
            user,
            payment,
            refund,
            repeated: true,
        })
    }

    /// Records the captured charge, commits the new assignment and, for a
    /// mid-cycle downgrade, refunds the superseded cycle.
    pub async fn settle(
        &self,
        change: PlanChange,
        capture: CapturedCharge,
    ) -> Result<Settlement, BillingError> {
        let intent_ref = capture.intent_ref.clone();

        let plan = self.catalog.resolve(&change.to_plan).await.map_err(|err| {
            error!(
                ?err,
                user_id = %change.user_id,
                plan_change_id = %change.id,
                intent_ref = ?intent_ref,
                to_plan = %change.to_plan,
                captured_minor = capture.amount_minor,
                "charged plan could not be resolved"
            );
            BillingError::SettlementInconsistency(format!(
                "plan {} could not be resolved",
                change.to_plan
            ))
        })?;

        let mut user = match self.users.find_user_by_id(change.user_id).await? {
            Some(user) => user,
            None => {
                error!(
                    user_id = %change.user_id,
                    plan_change_id = %change.id,
                    intent_ref = ?intent_ref,
                    captured_minor = capture.amount_minor,
                    "charged user no longer exists"
                );
                return Err(BillingError::SettlementInconsistency(format!(
                    "user {} could not be resolved",
                    change.user_id
                )));
            }
        };

        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: change.user_id,
            plan_id: plan.id.clone(),
            plan_change_id: Some(change.id),
            status: PaymentStatus::Success,
            amount: from_minor(capture.amount_minor),
            currency: capture.currency,
            gateway_charge_ref: capture.charge_ref,
            gateway_intent_ref: capture.intent_ref,
            created_at: OffsetDateTime::now_utc(),
        };
        let payment = self
            .billing
            .record_charge(change.id, payment)
            .await
            .map_err(|err| {
                error!(
                    ?err,
                    user_id = %change.user_id,
                    plan_change_id = %change.id,
                    intent_ref = ?intent_ref,
                    captured_minor = capture.amount_minor,
                    "captured charge could not be recorded"
                );
                BillingError::Database(err)
            })?;

        let assignment = PlanAssignment {
            change_id: change.id,
            user_id: change.user_id,
            expected_version: change.base_plan_version,
            cycle: BillingCycle {
                user_id: change.user_id,
                plan_id: plan.id.clone(),
                plan_price: change.new_price,
                payment_id: payment.id,
                cycle_start: payment.created_at,
                cycle_end: add_one_month(payment.created_at),
                captured_minor: to_minor(payment.amount),
                gateway_charge_ref: payment.gateway_charge_ref.clone(),
                plan_version: change.base_plan_version + 1,
                updated_at: payment.created_at,
            },
        };

        let outcome = self
            .billing
            .commit_assignment(assignment)
            .await
            .map_err(|err| {
                error!(
                    ?err,
                    user_id = %change.user_id,
                    plan_change_id = %change.id,
                    payment_id = %payment.id,
                    intent_ref = ?intent_ref,
                    "plan assignment could not be committed after charge"
                );
                BillingError::Database(err)
            })?;

        match outcome {
            AssignmentOutcome::Committed => {}
            AssignmentOutcome::AlreadySettled => return self.repeat(&change).await,
            AssignmentOutcome::VersionConflict => {
                let settled_elsewhere = self
                    .billing
                    .find_plan_change(change.id)
                    .await?
                    .map(|c| c.state.is_settled())
                    .unwrap_or(false);
                if settled_elsewhere {
                    return self.repeat(&change).await;
                }
                error!(
                    user_id = %change.user_id,
                    plan_change_id = %change.id,
                    payment_id = %payment.id,
                    intent_ref = ?intent_ref,
                    base_plan_version = change.base_plan_version,
                    captured_minor = to_minor(payment.amount),
                    "billing cycle changed while this plan change was being paid"
                );
                return Err(BillingError::SettlementInconsistency(
                    "billing cycle changed while the charge was in flight".into(),
                ));
            }
        }

        user.plan = Some(plan.id.clone());
        info!(
            user_id = %change.user_id,
            plan_change_id = %change.id,
            payment_id = %payment.id,
            to_plan = %plan.id,
            action = change.action.as_str(),
            captured_minor = to_minor(payment.amount),
            "plan change settled"
        );

        let refund = if owes_refund(&change) {
            Some(self.refunds.process(&change, &payment).await)
        } else {
            None
        };

        Ok(Settlement {
            user,
            payment: Some(payment),
            refund,
            repeated: false,
        })
    }
}

/// Downgrade that left unused days on the superseded cycle.
fn owes_refund(change: &PlanChange) -> bool {
    change.action == PlanAction::Downgrade && change.refund_due_minor > 0
}
