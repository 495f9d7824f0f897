use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "plan_action", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanAction {
    Start,
    Upgrade,
    Downgrade,
    Switch,
    Cancel,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::Start => "start",
            PlanAction::Upgrade => "upgrade",
            PlanAction::Downgrade => "downgrade",
            PlanAction::Switch => "switch",
            PlanAction::Cancel => "cancel",
        }
    }
}

/// Ledger entry. Rows are appended and never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanHistory {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_change_id: Option<Uuid>,
    pub from_plan: Option<String>,
    pub to_plan: String,
    pub action: PlanAction,
    pub old_price: Decimal,
    pub new_price: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_end: OffsetDateTime,
    pub remaining_days: i64,
    /// Theoretical credit in major units.
    pub credit_calculated: Decimal,
    pub discount_applied_minor: i64,
    pub refund_processed_minor: i64,
    pub refund_ref: Option<String>,
    pub payment_id: Option<Uuid>,
    pub note: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewPlanHistory {
    pub user_id: Uuid,
    pub plan_change_id: Option<Uuid>,
    pub from_plan: Option<String>,
    pub to_plan: String,
    pub action: PlanAction,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub cycle_start: OffsetDateTime,
    pub cycle_end: OffsetDateTime,
    pub remaining_days: i64,
    pub credit_calculated: Decimal,
    pub discount_applied_minor: i64,
    pub refund_processed_minor: i64,
    pub refund_ref: Option<String>,
    pub payment_id: Option<Uuid>,
    pub note: Option<String>,
}
