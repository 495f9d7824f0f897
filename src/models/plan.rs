use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::utils::money::to_minor;

/// Ordinal plan classification. Variant order is the tier order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, sqlx::Type,
)]
#[sqlx(type_name = "plan_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Premium => "premium",
            PlanTier::Pro => "pro",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(PlanTier::Free),
            "premium" => Some(PlanTier::Premium),
            "pro" => Some(PlanTier::Pro),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub tier: PlanTier,
    /// Price per monthly cycle in major currency units.
    pub price: Decimal,
    pub active: bool,
}

impl Plan {
    pub fn price_minor(&self) -> i64 {
        to_minor(self.price)
    }

    pub fn is_free(&self) -> bool {
        self.price.is_zero()
    }

    /// True when `reference` names this plan by tier or display name.
    pub fn matches_label(&self, reference: &str) -> bool {
        let needle = reference.trim();
        if let Some(tier) = PlanTier::parse(needle) {
            if tier == self.tier {
                return true;
            }
        }
        self.name.trim().eq_ignore_ascii_case(needle)
    }
}
