use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// The user's current paid cycle. One row per user, replaced only by a
/// compare-and-swap on `plan_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct BillingCycle {
    pub user_id: Uuid,
    pub plan_id: String,
    /// Price of `plan_id` when this cycle was paid for.
    pub plan_price: Decimal,
    pub payment_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_end: OffsetDateTime,
    pub captured_minor: i64,
    pub gateway_charge_ref: Option<String>,
    pub plan_version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}
