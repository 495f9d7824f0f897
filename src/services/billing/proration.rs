use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::plan_history::PlanAction;
use crate::services::billing::cycle::CycleWindow;
use crate::utils::money::to_minor;

/// Scale `credit_calculated` is stored at.
pub const CREDIT_SCALE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProrationOutcome {
    pub action: PlanAction,
    /// Unused value of the current cycle in major units. Zero unless the
    /// price changes mid-cycle.
    pub credit_calculated: Decimal,
    /// Subtracted from the new plan's price on this charge (upgrades only).
    pub discount_minor: i64,
    pub net_amount_minor: i64,
    /// Returned against the prior charge once the new one settles (downgrades only).
    pub refund_due_minor: i64,
}

pub fn classify(old_price: Option<Decimal>, new_price: Decimal) -> PlanAction {
    match old_price {
        None => PlanAction::Start,
        Some(old) if new_price > old => PlanAction::Upgrade,
        Some(old) if new_price < old => PlanAction::Downgrade,
        Some(_) => PlanAction::Switch,
    }
}

/// `old_price * remaining / total`, at the stored scale.
pub fn unused_credit(old_price: Decimal, window: &CycleWindow) -> Decimal {
    if window.remaining_days == 0 {
        return Decimal::ZERO;
    }
    (old_price * Decimal::from(window.remaining_days) / Decimal::from(window.total_days))
        .round_dp_with_strategy(CREDIT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// `old_price` is the price the current cycle was paid at; `None` for a
/// first purchase.
pub fn prorate(
    old_price: Option<Decimal>,
    new_price: Decimal,
    window: &CycleWindow,
) -> ProrationOutcome {
    let action = classify(old_price, new_price);
    let new_minor = to_minor(new_price);

    let mut outcome = ProrationOutcome {
        action,
        credit_calculated: Decimal::ZERO,
        discount_minor: 0,
        net_amount_minor: new_minor,
        refund_due_minor: 0,
    };

    let old = match (action, old_price) {
        (PlanAction::Upgrade | PlanAction::Downgrade, Some(old)) => old,
        _ => return outcome,
    };
    let credit = unused_credit(old, window);
    if credit.is_zero() {
        return outcome;
    }
    outcome.credit_calculated = credit;

    let credit_minor = to_minor(credit);
    if action == PlanAction::Upgrade {
        outcome.discount_minor = credit_minor.min(new_minor);
        outcome.net_amount_minor = (new_minor - outcome.discount_minor).max(0);
    } else {
        outcome.refund_due_minor = credit_minor;
    }
    outcome
}
