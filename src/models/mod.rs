pub mod billing_cycle;
pub mod payment;
pub mod plan;
pub mod plan_change;
pub mod plan_history;
pub mod user;
