use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::plan_history::PlanAction;

/// Progress of one plan-change attempt across the create and confirm calls.
///
/// ```text
/// initiated -> charged -> settled -> refund_pending -> refund_settled
///     |                                            \-> refund_failed
///     \-> abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "plan_change_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeState {
    Initiated,
    Charged,
    Settled,
    RefundPending,
    RefundSettled,
    RefundFailed,
    Abandoned,
}

impl PlanChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeState::Initiated => "initiated",
            PlanChangeState::Charged => "charged",
            PlanChangeState::Settled => "settled",
            PlanChangeState::RefundPending => "refund_pending",
            PlanChangeState::RefundSettled => "refund_settled",
            PlanChangeState::RefundFailed => "refund_failed",
            PlanChangeState::Abandoned => "abandoned",
        }
    }

    pub fn can_transition_to(&self, next: PlanChangeState) -> bool {
        use PlanChangeState::*;
        matches!(
            (self, next),
            (Initiated, Charged)
                | (Initiated, Abandoned)
                | (Charged, Settled)
                | (Settled, RefundPending)
                | (RefundPending, RefundSettled)
                | (RefundPending, RefundFailed)
        )
    }

    /// The user's plan assignment has been committed for this change.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PlanChangeState::Settled
                | PlanChangeState::RefundPending
                | PlanChangeState::RefundSettled
                | PlanChangeState::RefundFailed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanChange {
    pub id: Uuid,
    pub user_id: Uuid,
    pub from_plan: Option<String>,
    pub to_plan: String,
    pub action: PlanAction,
    pub old_price: Decimal,
    pub new_price: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_end: OffsetDateTime,
    pub total_days: i64,
    pub remaining_days: i64,
    pub credit_calculated: Decimal,
    pub discount_minor: i64,
    pub net_amount_minor: i64,
    pub refund_due_minor: i64,
    pub prior_payment_id: Option<Uuid>,
    pub prior_charge_ref: Option<String>,
    pub prior_captured_minor: i64,
    pub base_plan_version: i64,
    /// Timestamp captured when the change was created; every later
    /// recomputation for this change uses it instead of the wall clock.
    #[serde(with = "time::serde::rfc3339")]
    pub effective_at: OffsetDateTime,
    pub gateway_intent_ref: Option<String>,
    pub payment_id: Option<Uuid>,
    pub refund_ref: Option<String>,
    pub state: PlanChangeState,
    pub note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPlanChange {
    pub user_id: Uuid,
    pub from_plan: Option<String>,
    pub to_plan: String,
    pub action: PlanAction,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub cycle_start: OffsetDateTime,
    pub cycle_end: OffsetDateTime,
    pub total_days: i64,
    pub remaining_days: i64,
    pub credit_calculated: Decimal,
    pub discount_minor: i64,
    pub net_amount_minor: i64,
    pub refund_due_minor: i64,
    pub prior_payment_id: Option<Uuid>,
    pub prior_charge_ref: Option<String>,
    pub prior_captured_minor: i64,
    pub base_plan_version: i64,
    pub effective_at: OffsetDateTime,
}
