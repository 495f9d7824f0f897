use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::error;
use uuid::Uuid;

use crate::db::plan_history_repository::PlanHistoryRepository;
use crate::models::{
    plan_change::PlanChange,
    plan_history::{NewPlanHistory, PlanAction, PlanHistory},
};

/// Writes to the plan history. Entries are only ever appended.
#[derive(Clone)]
pub struct Ledger {
    history: Arc<dyn PlanHistoryRepository>,
}

impl Ledger {
    pub fn new(history: Arc<dyn PlanHistoryRepository>) -> Self {
        Self { history }
    }

    pub async fn append(&self, entry: NewPlanHistory) -> Result<PlanHistory, sqlx::Error> {
        self.history.append_entry(entry).await
    }

    /// Append once money has already moved. A failure cannot be surfaced to the
    /// caller any more, so everything needed to rebuild the entry by hand is
    /// logged instead.
    pub async fn append_after_charge(
        &self,
        entry: NewPlanHistory,
        intent_ref: Option<&str>,
    ) -> Option<PlanHistory> {
        let context = entry.clone();
        match self.history.append_entry(entry).await {
            Ok(row) => Some(row),
            Err(err) => {
                error!(
                    ?err,
                    user_id = %context.user_id,
                    plan_change_id = ?context.plan_change_id,
                    intent_ref,
                    from_plan = ?context.from_plan,
                    to_plan = %context.to_plan,
                    action = context.action.as_str(),
                    credit_calculated = %context.credit_calculated,
                    discount_applied_minor = context.discount_applied_minor,
                    refund_processed_minor = context.refund_processed_minor,
                    refund_ref = ?context.refund_ref,
                    payment_id = ?context.payment_id,
                    "ledger write failed after charge; entry must be reconstructed manually"
                );
                None
            }
        }
    }
}

/// Entry recorded when a change is priced, before any money moves.
pub fn pre_charge_entry(change: &PlanChange) -> NewPlanHistory {
    NewPlanHistory {
        user_id: change.user_id,
        plan_change_id: Some(change.id),
        from_plan: change.from_plan.clone(),
        to_plan: change.to_plan.clone(),
        action: change.action,
        old_price: change.old_price,
        new_price: change.new_price,
        cycle_start: change.cycle_start,
        cycle_end: change.cycle_end,
        remaining_days: change.remaining_days,
        credit_calculated: change.credit_calculated,
        discount_applied_minor: change.discount_minor,
        refund_processed_minor: 0,
        refund_ref: None,
        payment_id: None,
        note: Some(format!("net charge {} minor units", change.net_amount_minor)),
    }
}

/// Entry recorded after a refund attempt for a downgrade, successful or not.
pub fn refund_entry(
    change: &PlanChange,
    credit_calculated: Decimal,
    remaining_days: i64,
    payment_id: Uuid,
    refunded_minor: i64,
    refund_ref: Option<String>,
    note: String,
) -> NewPlanHistory {
    NewPlanHistory {
        user_id: change.user_id,
        plan_change_id: Some(change.id),
        from_plan: change.from_plan.clone(),
        to_plan: change.to_plan.clone(),
        action: PlanAction::Downgrade,
        old_price: change.old_price,
        new_price: change.new_price,
        cycle_start: change.cycle_start,
        cycle_end: change.cycle_end,
        remaining_days,
        credit_calculated,
        discount_applied_minor: 0,
        refund_processed_minor: refunded_minor,
        refund_ref,
        payment_id: Some(payment_id),
        note: Some(note),
    }
}
