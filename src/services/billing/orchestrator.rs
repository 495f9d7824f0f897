use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{billing_repository::BillingRepository, user_repository::UserRepository};
use crate::models::{
    plan::Plan,
    plan_change::{NewPlanChange, PlanChange, PlanChangeState},
    plan_history::PlanAction,
};
use crate::services::billing::{
    catalog::PlanCatalog,
    cycle::CycleWindow,
    error::BillingError,
    ledger::{pre_charge_entry, Ledger},
    proration::prorate,
    settlement::{CapturedCharge, Settlement, SettlementConfirmer},
};
use crate::services::gateway::{CreateIntentRequest, PaymentGateway, INTENT_STATUS_CANCELED};

#[derive(Debug, Clone)]
pub enum ChargeOutcome {
    /// The client must complete payment, then call confirm.
    AwaitingPayment {
        client_secret: String,
        intent_ref: String,
        plan: Plan,
        action: PlanAction,
        net_amount_minor: i64,
    },
    /// Nothing to charge; the change settled immediately.
    Settled {
        plan: Plan,
        action: PlanAction,
        settlement: Settlement,
    },
}

#[derive(Clone)]
pub struct ChargeOrchestrator {
    users: Arc<dyn UserRepository>,
    billing: Arc<dyn BillingRepository>,
    catalog: PlanCatalog,
    ledger: Ledger,
    gateway: Arc<dyn PaymentGateway>,
    confirmer: SettlementConfirmer,
    currency: String,
}

impl ChargeOrchestrator {
    pub fn new(
        users: Arc<dyn UserRepository>,
        billing: Arc<dyn BillingRepository>,
        catalog: PlanCatalog,
        ledger: Ledger,
        gateway: Arc<dyn PaymentGateway>,
        confirmer: SettlementConfirmer,
        currency: String,
    ) -> Self {
        Self {
            users,
            billing,
            catalog,
            ledger,
            gateway,
            confirmer,
            currency,
        }
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        target_reference: &str,
    ) -> Result<ChargeOutcome, BillingError> {
        let plan = self.catalog.resolve(target_reference).await?;
        self.create_for_plan(user_id, plan, OffsetDateTime::now_utc())
            .await
    }

    /// Switches to a zero-priced plan without touching the gateway for the
    /// new charge. Downgrade refunds still go through it.
    pub async fn activate_free(
        &self,
        user_id: Uuid,
        target_reference: &str,
    ) -> Result<Settlement, BillingError> {
        let plan = self.catalog.resolve(target_reference).await?;
        if !plan.is_free() {
            return Err(BillingError::Validation(format!(
                "plan {} is not free",
                plan.id
            )));
        }
        match self
            .create_for_plan(user_id, plan, OffsetDateTime::now_utc())
            .await?
        {
            ChargeOutcome::Settled { settlement, .. } => Ok(settlement),
            ChargeOutcome::AwaitingPayment { .. } => Err(BillingError::Validation(
                "plan requires payment".into(),
            )),
        }
    }

    pub(crate) async fn create_for_plan(
        &self,
        user_id: Uuid,
        plan: Plan,
        now: OffsetDateTime,
    ) -> Result<ChargeOutcome, BillingError> {
        if !plan.active {
            return Err(BillingError::Validation(format!(
                "plan {} is not available",
                plan.id
            )));
        }
        let user = self
            .users
            .find_user_by_id(user_id)
            .await?
            .ok_or(BillingError::UserNotFound(user_id))?;

        self.supersede_open_change(user_id).await?;

        let cycle = self.billing.find_billing_cycle(user_id).await?;
        let window = match &cycle {
            Some(c) => CycleWindow::between(c.cycle_start, c.cycle_end, now),
            None => CycleWindow::anchored(None, now),
        };
        if let Some(c) = &cycle {
            if c.plan_id == plan.id && !window.has_ended() {
                return Err(BillingError::Validation(format!(
                    "already subscribed to {} for the current cycle",
                    plan.id
                )));
            }
        }

        let proration = prorate(cycle.as_ref().map(|c| c.plan_price), plan.price, &window);
        let new_change = NewPlanChange {
            user_id,
            from_plan: cycle.as_ref().map(|c| c.plan_id.clone()).or(user.plan),
            to_plan: plan.id.clone(),
            action: proration.action,
            old_price: cycle.as_ref().map(|c| c.plan_price).unwrap_or(Decimal::ZERO),
            new_price: plan.price,
            cycle_start: window.cycle_start,
            cycle_end: window.cycle_end,
            total_days: window.total_days,
            remaining_days: window.remaining_days,
            credit_calculated: proration.credit_calculated,
            discount_minor: proration.discount_minor,
            net_amount_minor: proration.net_amount_minor,
            refund_due_minor: proration.refund_due_minor,
            prior_payment_id: cycle.as_ref().map(|c| c.payment_id),
            prior_charge_ref: cycle.as_ref().and_then(|c| c.gateway_charge_ref.clone()),
            prior_captured_minor: cycle.as_ref().map(|c| c.captured_minor).unwrap_or(0),
            base_plan_version: cycle.as_ref().map(|c| c.plan_version).unwrap_or(0),
            effective_at: now,
        };

        let change = self
            .billing
            .insert_plan_change(new_change)
            .await?
            .ok_or(BillingError::ChangeInProgress)?;

        if let Err(err) = self.ledger.append(pre_charge_entry(&change)).await {
            error!(
                ?err,
                %user_id,
                plan_change_id = %change.id,
                "pre-charge ledger entry failed"
            );
            self.abandon(&change, "pre-charge ledger entry could not be written")
                .await;
            return Err(BillingError::Database(err));
        }

        info!(
            %user_id,
            plan_change_id = %change.id,
            to_plan = %plan.id,
            action = change.action.as_str(),
            credit_calculated = %change.credit_calculated,
            discount_minor = change.discount_minor,
            net_amount_minor = change.net_amount_minor,
            refund_due_minor = change.refund_due_minor,
            "plan change priced"
        );

        let action = change.action;
        if change.net_amount_minor == 0 {
            let settlement = self
                .confirmer
                .settle(change, CapturedCharge::free(&self.currency))
                .await?;
            return Ok(ChargeOutcome::Settled {
                plan,
                action,
                settlement,
            });
        }

        let net_amount_minor = change.net_amount_minor;
        let created = match self
            .gateway
            .create_intent(CreateIntentRequest {
                amount_minor: net_amount_minor,
                currency: self.currency.clone(),
                metadata: intent_metadata(&change),
            })
            .await
        {
            Ok(created) => created,
            Err(err) => {
                warn!(
                    ?err,
                    %user_id,
                    plan_change_id = %change.id,
                    net_amount_minor,
                    "payment intent creation failed"
                );
                self.abandon(&change, "payment intent could not be created")
                    .await;
                return Err(err.into());
            }
        };

        if let Err(err) = self
            .billing
            .attach_intent(change.id, &created.intent_ref)
            .await
        {
            // Confirmation finds the change through the intent metadata.
            error!(
                ?err,
                %user_id,
                plan_change_id = %change.id,
                intent_ref = %created.intent_ref,
                "could not attach intent to plan change"
            );
        }

        Ok(ChargeOutcome::AwaitingPayment {
            client_secret: created.client_secret,
            intent_ref: created.intent_ref,
            plan,
            action,
            net_amount_minor,
        })
    }

    /// Clears the way for a new attempt. The open change is abandoned only once
    /// its intent is known not to capture; otherwise it must be confirmed first.
    async fn supersede_open_change(&self, user_id: Uuid) -> Result<(), BillingError> {
        let Some(open) = self.billing.find_open_plan_change(user_id).await? else {
            return Ok(());
        };

        if let Some(intent_ref) = open.gateway_intent_ref.as_deref() {
            let snapshot = self.gateway.retrieve_intent(intent_ref).await?;
            match snapshot.status.as_str() {
                INTENT_STATUS_CANCELED => {}
                status if status.starts_with("requires_") => {
                    if let Err(err) = self.gateway.cancel_intent(intent_ref).await {
                        warn!(?err, %user_id, intent_ref, "could not cancel superseded intent");
                        return Err(BillingError::ChangeInProgress);
                    }
                }
                // succeeded, processing, or anything else that may still capture
                status => {
                    info!(%user_id, intent_ref, status, "open intent is not cancellable");
                    return Err(BillingError::ChangeInProgress);
                }
            }
        }

        let abandoned = self
            .billing
            .transition_plan_change(
                open.id,
                PlanChangeState::Initiated,
                PlanChangeState::Abandoned,
                Some("superseded by a newer plan change"),
            )
            .await?;
        if !abandoned {
            return Err(BillingError::ChangeInProgress);
        }
        info!(%user_id, plan_change_id = %open.id, "superseded open plan change");
        Ok(())
    }

    async fn abandon(&self, change: &PlanChange, note: &str) {
        if let Err(err) = self
            .billing
            .transition_plan_change(
                change.id,
                PlanChangeState::Initiated,
                PlanChangeState::Abandoned,
                Some(note),
            )
            .await
        {
            error!(?err, plan_change_id = %change.id, "could not abandon plan change");
        }
    }
}

fn intent_metadata(change: &PlanChange) -> BTreeMap<String, String> {
    [
        ("user_id", change.user_id.to_string()),
        ("plan_change_id", change.id.to_string()),
        ("target_plan", change.to_plan.clone()),
        ("action", change.action.as_str().to_string()),
        ("discount_minor", change.discount_minor.to_string()),
        ("net_amount_minor", change.net_amount_minor.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
